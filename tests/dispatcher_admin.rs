// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Exercises `Dispatcher` and `AdminApi` together against a running
//! `QueueManager`, the combination none of the in-module unit tests cover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embermq::admin::AdminApi;
use embermq::config::{HandlerOptions, QueueConfig};
use embermq::dispatcher::{Dispatcher, Handler, HandlerContext, HandlerFactory, HandlerResult};
use embermq::envelope::{Envelope, EnvelopeMetadata};
use embermq::manager::QueueManager;

fn no_persistence() -> QueueConfig {
    QueueConfig::builder()
        .capacity(embermq::config::MIN_CAPACITY)
        .dead_letter_capacity(embermq::config::MIN_DEAD_LETTER_CAPACITY)
        .enable_persistence(false)
        .build()
        .unwrap()
}

#[test]
fn dispatcher_processes_messages_and_admin_api_reports_it() {
    let manager = QueueManager::new(no_persistence()).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(manager.clone()));
    let admin = AdminApi::new(Arc::clone(&dispatcher));

    let processed = Arc::new(AtomicUsize::new(0));
    let processed_clone = Arc::clone(&processed);
    let factory: Arc<HandlerFactory> = Arc::new(move || {
        let processed = Arc::clone(&processed_clone);
        Box::new(move |_env: &Envelope, _ctx: &HandlerContext<'_>| -> HandlerResult {
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }) as Box<dyn Handler>
    });

    let mut options = HandlerOptions::default();
    options.min_parallelism = 2;
    options.max_parallelism = 4;
    options.timeout = Duration::from_secs(2);
    dispatcher
        .register_handler("order.created", factory, options)
        .unwrap();

    dispatcher.start().unwrap();

    for n in 0..10 {
        manager
            .enqueue(
                "order.created",
                vec![n],
                None,
                None,
                EnvelopeMetadata::default(),
            )
            .unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while processed.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    let snapshot = admin.snapshot();
    assert_eq!(snapshot.engine.enqueued, 10);
    assert_eq!(snapshot.engine.acknowledged, 10);
    assert_eq!(snapshot.live_message_count, 0);
    assert_eq!(snapshot.dead_letter_count, 0);

    let handler_metrics = admin.handler_metrics();
    let order_metrics = handler_metrics.get("order.created").unwrap();
    assert_eq!(order_metrics.total_processed, 10);

    admin.scale("order.created", 1).unwrap();

    dispatcher.stop().unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), 10);
}

#[test]
fn admin_api_replays_and_purges_dead_letters() {
    let manager = QueueManager::new(no_persistence()).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(manager.clone()));
    let admin = AdminApi::new(Arc::clone(&dispatcher));

    let id = manager
        .enqueue(
            "order.created",
            b"bad".to_vec(),
            None,
            Some(0),
            EnvelopeMetadata::default(),
        )
        .unwrap();
    manager
        .checkout("order.created", "h1", Duration::from_secs(30))
        .unwrap();
    manager.requeue(id, None).unwrap();

    assert_eq!(admin.list_dead_letters().len(), 1);

    admin.replay_dead_letter(id).unwrap();
    assert_eq!(admin.list_dead_letters().len(), 0);
    assert!(manager.get_message(id).is_some());

    manager
        .checkout("order.created", "h1", Duration::from_secs(30))
        .unwrap();
    manager.requeue(id, None).unwrap();
    assert_eq!(admin.list_dead_letters().len(), 1);

    let purged = admin.purge_dead_letters(None);
    assert_eq!(purged, 1);
    assert_eq!(admin.list_dead_letters().len(), 0);
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios against the public API, one per literal case this
//! crate lineage's test suites enumerate alongside unit coverage.

use std::time::Duration;

use embermq::config::QueueConfig;
use embermq::envelope::{EnvelopeMetadata, Status};
use embermq::error::Error;
use embermq::manager::QueueManager;

fn no_persistence(capacity: usize) -> QueueConfig {
    QueueConfig::builder()
        .capacity(capacity.max(embermq::config::MIN_CAPACITY))
        .dead_letter_capacity(embermq::config::MIN_DEAD_LETTER_CAPACITY)
        .enable_persistence(false)
        .default_initial_backoff(Duration::ZERO)
        .default_max_backoff(Duration::ZERO)
        .build()
        .unwrap()
}

#[test]
fn capacity_full_then_frees_a_slot_on_ack() {
    let manager = QueueManager::new(no_persistence(2)).unwrap();

    let m1 = manager
        .enqueue("t", b"m1".to_vec(), None, None, EnvelopeMetadata::default())
        .unwrap();
    manager
        .enqueue("t", b"m2".to_vec(), None, None, EnvelopeMetadata::default())
        .unwrap();
    let full = manager.enqueue("t", b"m3".to_vec(), None, None, EnvelopeMetadata::default());
    assert!(matches!(full, Err(Error::QueueFull)));

    let checked_out = manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
    assert_eq!(checked_out.message_id, m1);
    manager.acknowledge(m1, "h1").unwrap();

    let m3 = manager
        .enqueue("t", b"m3".to_vec(), None, None, EnvelopeMetadata::default())
        .unwrap();

    assert_eq!(manager.get_count(), 2);
    assert!(manager.get_message(m1).is_none());
    assert!(manager.get_message(m3).is_some());
}

#[test]
fn dedup_ready_replacement_drops_predecessor_outright() {
    let manager = QueueManager::new(no_persistence(embermq::config::MIN_CAPACITY)).unwrap();

    let a = manager
        .enqueue("t", b"v1".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();
    let b = manager
        .enqueue("t", b"v2".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();

    assert!(manager.get_message(a).is_none());
    let env_b = manager.get_message(b).unwrap();
    assert_eq!(env_b.status, Status::Ready);
    assert_eq!(env_b.payload, b"v2");
}

#[test]
fn dedup_inflight_supersede_keeps_lease_and_acking_it_is_a_noop() {
    let manager = QueueManager::new(no_persistence(embermq::config::MIN_CAPACITY)).unwrap();

    let a = manager
        .enqueue("t", b"v1".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();
    let checked_out = manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
    assert_eq!(checked_out.message_id, a);

    let b = manager
        .enqueue("t", b"v2".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();

    let superseded_a = manager.get_message(a).unwrap();
    assert_eq!(superseded_a.status, Status::Superseded);
    assert!(superseded_a.lease.is_some());

    let env_b = manager.get_message(b).unwrap();
    assert_eq!(env_b.status, Status::Ready);

    manager.acknowledge(a, "h1").unwrap();
    assert!(manager.get_message(a).is_none());

    let checked_out_b = manager.checkout("t", "h2", Duration::from_secs(30)).unwrap();
    assert_eq!(checked_out_b.message_id, b);
}

#[test]
fn exhausting_max_retries_routes_to_dead_letter_with_reason() {
    let manager = QueueManager::new(no_persistence(embermq::config::MIN_CAPACITY)).unwrap();
    let id = manager
        .enqueue("t", b"boom".to_vec(), None, Some(2), EnvelopeMetadata::default())
        .unwrap();

    for expected_retry_count in 1..=2u32 {
        manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
        manager.requeue(id, None).unwrap();
        let env = manager.get_message(id).unwrap();
        assert_eq!(env.retry_count, expected_retry_count);
    }

    manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
    manager.requeue(id, None).unwrap();

    assert!(manager.get_message(id).is_none());
    let dead = manager.dead_letters().get(id).unwrap();
    assert_eq!(dead.failure.failure_reason, "max retries exceeded");
}

#[test]
fn crash_recovery_restores_unacked_messages_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        QueueConfig::builder()
            .capacity(embermq::config::MIN_CAPACITY)
            .dead_letter_capacity(embermq::config::MIN_DEAD_LETTER_CAPACITY)
            .enable_persistence(true)
            .persistence_path(dir.path().to_path_buf())
            .build()
            .unwrap()
    };

    let manager = QueueManager::new(config()).unwrap();
    let mut ids = Vec::new();
    for n in 1..=5 {
        ids.push(
            manager
                .enqueue("t", vec![n], None, None, EnvelopeMetadata::default())
                .unwrap(),
        );
    }
    manager.snapshot_now().unwrap();
    for n in 6..=7 {
        ids.push(
            manager
                .enqueue("t", vec![n], None, None, EnvelopeMetadata::default())
                .unwrap(),
        );
    }
    let checked_out = manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
    assert_eq!(checked_out.message_id, ids[0]);
    manager.acknowledge(ids[0], "h1").unwrap();

    drop(manager);

    let recovered = QueueManager::new(config()).unwrap();
    assert_eq!(recovered.get_count(), 6);
    assert!(recovered.get_message(ids[0]).is_none());
    for id in &ids[1..] {
        let env = recovered.get_message(*id).unwrap();
        assert_eq!(env.status, Status::Ready);
    }
}

#[test]
fn crash_recovery_keeps_only_the_dedup_survivor() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        QueueConfig::builder()
            .capacity(embermq::config::MIN_CAPACITY)
            .dead_letter_capacity(embermq::config::MIN_DEAD_LETTER_CAPACITY)
            .enable_persistence(true)
            .persistence_path(dir.path().to_path_buf())
            .build()
            .unwrap()
    };

    let manager = QueueManager::new(config()).unwrap();
    let first = manager
        .enqueue("t", b"v1".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();
    manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
    let second = manager
        .enqueue("t", b"v2".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();

    let predecessor = manager.get_message(first).unwrap();
    assert_eq!(predecessor.status, Status::Superseded);

    drop(manager);

    // The superseded predecessor's slot survives the crash (it's still
    // occupied, just dead weight until its late ack or a future replace
    // frees it) but it must not have resurrected as a live `Ready` envelope
    // sharing `second`'s dedup key -- exactly one envelope is live.
    let recovered = QueueManager::new(config()).unwrap();
    let live: Vec<_> = recovered
        .list_all()
        .into_iter()
        .filter(|env| matches!(env.status, Status::Ready | Status::InFlight))
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].message_id, second);

    let restored_predecessor = recovered.get_message(first).unwrap();
    assert_eq!(restored_predecessor.status, Status::Superseded);
    let survivor = recovered.get_message(second).unwrap();
    assert_eq!(survivor.status, Status::Ready);
    assert_eq!(survivor.payload, b"v2");
}

#[test]
fn crash_recovery_after_ready_dedup_replacement_drops_predecessor() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        QueueConfig::builder()
            .capacity(embermq::config::MIN_CAPACITY)
            .dead_letter_capacity(embermq::config::MIN_DEAD_LETTER_CAPACITY)
            .enable_persistence(true)
            .persistence_path(dir.path().to_path_buf())
            .build()
            .unwrap()
    };

    let manager = QueueManager::new(config()).unwrap();
    let first = manager
        .enqueue("t", b"v1".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();
    let second = manager
        .enqueue("t", b"v2".to_vec(), Some("K".into()), None, EnvelopeMetadata::default())
        .unwrap();

    drop(manager);

    let recovered = QueueManager::new(config()).unwrap();
    assert_eq!(recovered.get_count(), 1);
    assert!(recovered.get_message(first).is_none());
    assert_eq!(recovered.get_message(second).unwrap().payload, b"v2");
}

#[test]
fn expired_lease_is_reclaimed_by_the_monitor_with_incremented_retry_count() {
    let mut config = no_persistence(embermq::config::MIN_CAPACITY);
    config.lease_monitor_interval = Duration::from_millis(50);
    let manager = QueueManager::new(config).unwrap();

    let id = manager
        .enqueue("t", b"m1".to_vec(), None, None, EnvelopeMetadata::default())
        .unwrap();
    manager.checkout("t", "h1", Duration::from_millis(500)).unwrap();

    manager.start().unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    manager.stop().unwrap();

    let env = manager.get_message(id).unwrap();
    assert_eq!(env.status, Status::Ready);
    assert_eq!(env.retry_count, 1);
}

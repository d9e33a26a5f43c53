// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-message-type worker pool (distilled spec §4.4).
//!
//! Each worker is a plain OS thread, following the stop-flag-plus-handle
//! shape used by the reliability-protocol worker loops elsewhere in this
//! crate lineage: a thread loops checking out work until told to stop, and
//! `scale` adds or removes threads by spawning new ones or flipping a
//! per-worker stop flag and joining. Handlers run on a second, detached
//! thread so a handler that ignores its deadline can be timed out via
//! a bounded `crossbeam::channel`'s `recv_timeout` without blocking the worker loop --
//! std::thread has no preemptive cancellation, so a timed-out handler
//! thread is abandoned rather than killed; the lease it was holding expires
//! on its own and the lease monitor reclaims the message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};

use crate::config::HandlerOptions;
use crate::dispatcher::handler::{HandlerContext, HandlerFactory};
use crate::envelope::{now_ms, FailureInfo};
use crate::manager::QueueManager;
use crate::metrics::{HandlerMetrics, HandlerMetricsSnapshot};
use crate::wake::WakeNotifier;

/// Fallback poll interval used when a worker finds nothing to check out:
/// bounds how long a message becomes eligible via `not_before` elapsing
/// before a worker notices without relying on a fresh `notify()`.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct WorkerHandle {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Runs `min_parallelism..=max_parallelism` worker threads for one message
/// type, checking out `Ready` envelopes and invoking the registered
/// handler factory's instances against them.
pub struct WorkerPool {
    message_type: String,
    manager: QueueManager,
    factory: Arc<HandlerFactory>,
    options: HandlerOptions,
    metrics: Arc<HandlerMetrics>,
    wake: Arc<WakeNotifier>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        message_type: String,
        manager: QueueManager,
        factory: Arc<HandlerFactory>,
        options: HandlerOptions,
    ) -> Self {
        let wake = manager.wake_handle();
        Self {
            message_type,
            manager,
            factory,
            options,
            metrics: Arc::new(HandlerMetrics::new()),
            wake,
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> HandlerMetricsSnapshot {
        let active = self.workers.lock().unwrap().len();
        self.metrics.snapshot(active)
    }

    /// Spawn `min_parallelism` workers.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.options.min_parallelism {
            workers.push(self.spawn_worker());
        }
    }

    /// Stop and join every worker.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter() {
            worker.stop_flag.store(true, Ordering::Release);
        }
        self.wake.notify();
        for worker in workers.drain(..) {
            let _ = worker.join.join();
        }
    }

    /// Adjust the number of running workers, clamped to
    /// `[min_parallelism, max_parallelism]`.
    pub fn scale(&self, target: usize) {
        let target = target.clamp(self.options.min_parallelism, self.options.max_parallelism);
        let mut workers = self.workers.lock().unwrap();
        match target.cmp(&workers.len()) {
            std::cmp::Ordering::Greater => {
                for _ in workers.len()..target {
                    workers.push(self.spawn_worker());
                }
            }
            std::cmp::Ordering::Less => {
                let removed: Vec<WorkerHandle> = workers.drain(target..).collect();
                for worker in &removed {
                    worker.stop_flag.store(true, Ordering::Release);
                }
                self.wake.notify();
                for worker in removed {
                    let _ = worker.join.join();
                }
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_flag);
        let message_type = self.message_type.clone();
        let manager = self.manager.clone();
        let factory = Arc::clone(&self.factory);
        let options = self.options.clone();
        let metrics = Arc::clone(&self.metrics);
        let wake = Arc::clone(&self.wake);

        let join = std::thread::spawn(move || {
            let worker_id = format!("{message_type}-{:p}", &thread_stop);
            while !thread_stop.load(Ordering::Acquire) {
                let processed = run_once(&manager, &message_type, &worker_id, &factory, &options, &metrics);
                if !processed {
                    wake.wait_timeout(POLL_INTERVAL);
                }
            }
        });

        WorkerHandle { stop_flag, join }
    }
}

fn run_once(
    manager: &QueueManager,
    message_type: &str,
    worker_id: &str,
    factory: &Arc<HandlerFactory>,
    options: &HandlerOptions,
    metrics: &Arc<HandlerMetrics>,
) -> bool {
    let Some(envelope) = manager.checkout(message_type, worker_id, options.lease_duration) else {
        return false;
    };

    let lease_expiry = envelope
        .lease
        .as_ref()
        .map_or(now_ms(), |l| l.expiry_ts);
    let lease_remaining = Duration::from_millis(lease_expiry.saturating_sub(now_ms()));
    let safety_margin = crate::config::DEFAULT_DEADLINE_SAFETY_MARGIN;
    let deadline = options
        .timeout
        .min(lease_remaining.saturating_sub(safety_margin));

    let message_id = envelope.message_id;
    let envelope_for_handler = Arc::clone(&envelope);
    let factory = Arc::clone(factory);
    let heartbeat_manager = manager.clone();

    let (tx, rx) = channel::bounded(1);
    let spawn_result = std::thread::Builder::new()
        .name(format!("handler-{message_id}"))
        .spawn(move || {
            let handler = factory();
            let report = move |pct: u8, msg: Option<String>| {
                heartbeat_manager.heartbeat(message_id, pct, msg);
            };
            let ctx = HandlerContext::new(message_id, &report);
            let result = handler.handle(&envelope_for_handler, &ctx);
            let _ = tx.send(result);
        });

    if spawn_result.is_err() {
        log::error!("failed to spawn handler thread for {message_id}");
        let _ = manager.requeue(message_id, Some(FailureInfo {
            failure_reason: "failed to spawn handler thread".into(),
            exception_type: None,
            exception_message: None,
            stack_trace: None,
            failure_timestamp: now_ms(),
            last_handler_id: Some(worker_id.to_string()),
        }));
        return true;
    }

    let started = Instant::now();
    match rx.recv_timeout(deadline) {
        Ok(Ok(())) => {
            metrics.record_processed();
            if let Err(e) = manager.acknowledge(message_id, worker_id) {
                log::warn!("acknowledge failed for {message_id}: {e}");
            }
        }
        Ok(Err(handler_err)) => {
            metrics.record_failed(now_ms());
            let failure = FailureInfo {
                failure_reason: handler_err.reason,
                exception_type: handler_err.exception_type,
                exception_message: handler_err.exception_message,
                stack_trace: handler_err.stack_trace,
                failure_timestamp: now_ms(),
                last_handler_id: Some(worker_id.to_string()),
            };
            if let Err(e) = manager.requeue_with_backoff(
                message_id,
                Some(failure),
                options.backoff_strategy,
                options.initial_backoff,
                options.max_backoff,
            ) {
                log::warn!("requeue failed for {message_id}: {e}");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            log::warn!(
                "handler timed out after {:?} for {message_id}",
                started.elapsed()
            );
            metrics.record_failed(now_ms());
            let failure = FailureInfo {
                failure_reason: "handler timeout".into(),
                exception_type: None,
                exception_message: None,
                stack_trace: None,
                failure_timestamp: now_ms(),
                last_handler_id: Some(worker_id.to_string()),
            };
            if let Err(e) = manager.requeue_with_backoff(
                message_id,
                Some(failure),
                options.backoff_strategy,
                options.initial_backoff,
                options.max_backoff,
            ) {
                log::warn!("requeue failed for {message_id}: {e}");
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            log::error!("handler thread for {message_id} panicked");
            metrics.record_failed(now_ms());
            let failure = FailureInfo {
                failure_reason: "handler thread panicked".into(),
                exception_type: None,
                exception_message: None,
                stack_trace: None,
                failure_timestamp: now_ms(),
                last_handler_id: Some(worker_id.to_string()),
            };
            if let Err(e) = manager.requeue_with_backoff(
                message_id,
                Some(failure),
                options.backoff_strategy,
                options.initial_backoff,
                options.max_backoff,
            ) {
                log::warn!("requeue failed for {message_id}: {e}");
            }
        }
    }
    true
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lease expiry reclamation and handler progress heartbeats (distilled spec §4.6).
//!
//! The monitor itself follows the stop-flag-plus-joined-thread shape used by
//! the worker-pool loops elsewhere in this crate lineage: a background
//! thread ticks on an interval, a condvar lets `stop` wake it early, and
//! `Drop` joins the thread so no monitor outlives its queue.
//!
//! Heartbeats are an ephemeral, best-effort side channel -- they are never
//! journaled, so a crash loses in-flight progress but never correctness,
//! matching distilled spec §4.6's "ephemeral, not part of the durability
//! contract" note. The bounded LRU cache mirrors the pinned-entry type cache
//! used for hot lookups elsewhere in this lineage, without the pinning.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Condvar, Mutex as PLMutex};

use crate::envelope::{now_ms, MessageId, TimestampMs};

/// Most recent progress report for one in-flight message.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub progress_pct: u8,
    pub message: Option<String>,
    pub updated_at: TimestampMs,
}

/// Bounded, ephemeral store of handler progress reports.
pub struct HeartbeatStore {
    cache: PLMutex<LruCache<MessageId, HeartbeatRecord>>,
}

impl HeartbeatStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: PLMutex::new(LruCache::new(capacity)),
        }
    }

    /// Record a progress update for `id`, clamping `progress_pct` to 0..=100.
    pub fn heartbeat(&self, id: MessageId, progress_pct: u8, message: Option<String>) {
        let record = HeartbeatRecord {
            progress_pct: progress_pct.min(100),
            message,
            updated_at: now_ms(),
        };
        self.cache.lock().put(id, record);
    }

    #[must_use]
    pub fn progress(&self, id: MessageId) -> Option<HeartbeatRecord> {
        self.cache.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: MessageId) {
        self.cache.lock().pop(&id);
    }
}

/// Callback invoked once per reclaimed lease, with the id whose lease expired.
pub type ExpiryCallback = dyn Fn(MessageId) + Send + Sync;

/// Background thread that periodically reclaims expired `InFlight` leases.
pub struct LeaseMonitor {
    stop_flag: Arc<AtomicBool>,
    wake: Arc<(PLMutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseMonitor {
    /// Spawn the monitor thread. It ticks every `interval`, calling `scan`
    /// with the current time to find expired leases and invoking
    /// `on_expired` for each one found. `scan` is a closure rather than a
    /// direct `SlotArray` handle so the monitor doesn't need to share
    /// ownership of the queue's internals -- it only needs to ask for one.
    pub fn start(
        interval: Duration,
        scan: impl Fn(TimestampMs) -> Vec<MessageId> + Send + Sync + 'static,
        on_expired: Arc<ExpiryCallback>,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let wake = Arc::new((PLMutex::new(false), Condvar::new()));

        let thread_stop = Arc::clone(&stop_flag);
        let thread_wake = Arc::clone(&wake);
        let handle = std::thread::spawn(move || {
            let (lock, condvar) = &*thread_wake;
            loop {
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                let now = now_ms();
                for id in scan(now) {
                    on_expired(id);
                }

                let mut guard = lock.lock();
                if !thread_stop.load(Ordering::Acquire) {
                    let _ = condvar.wait_for(&mut guard, interval);
                }
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
            }
        });

        Self {
            stop_flag,
            wake,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the monitor thread to stop and wait for it to exit.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let (lock, condvar) = &*self.wake;
        let _guard = lock.lock();
        condvar.notify_all();
        drop(_guard);

        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LeaseMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeMetadata, Lease};
    use crate::slots::SlotArray;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn heartbeat_store_records_and_evicts_lru() {
        let store = HeartbeatStore::new(1);
        let a = MessageId::generate(1);
        let b = MessageId::generate(2);
        store.heartbeat(a, 50, Some("halfway".into()));
        assert_eq!(store.progress(a).unwrap().progress_pct, 50);

        store.heartbeat(b, 10, None);
        assert!(store.progress(a).is_none());
        assert!(store.progress(b).is_some());
    }

    #[test]
    fn heartbeat_clamps_progress_to_100() {
        let store = HeartbeatStore::new(4);
        let id = MessageId::generate(1);
        store.heartbeat(id, 250, None);
        assert_eq!(store.progress(id).unwrap().progress_pct, 100);
    }

    #[test]
    fn monitor_reclaims_expired_lease_and_invokes_callback() {
        let slots = Arc::new(SlotArray::new(4));
        let env = Envelope::new(
            MessageId::generate(1),
            "t",
            vec![1],
            None,
            3,
            EnvelopeMetadata::default(),
        );
        let checked_out = env.checked_out(Lease::new("h1", 1), 1);
        let id = checked_out.message_id;
        slots.enqueue(checked_out);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let callback: Arc<ExpiryCallback> = Arc::new(move |reclaimed_id| {
            if reclaimed_id == id {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        std::thread::sleep(Duration::from_millis(5));
        let scan_slots = Arc::clone(&slots);
        let monitor = LeaseMonitor::start(
            Duration::from_millis(10),
            move |now| scan_slots.expired_leases(now),
            callback,
        );
        std::thread::sleep(Duration::from_millis(60));
        monitor.stop();

        assert!(seen.load(Ordering::SeqCst) >= 1);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queue manager: the single entry point orchestrating the slot array,
//! dedup index, dead-letter store, and persister into one coherent API
//! (distilled spec §4.3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{BackoffStrategy, QueueConfig};
use crate::dead_letter::DeadLetterStore;
use crate::dedup::DedupIndex;
use crate::envelope::{
    now_ms, Envelope, EnvelopeMetadata, FailureInfo, Lease, MessageId, Status, TimestampMs,
};
use crate::error::{Error, Result};
use crate::lease::{HeartbeatRecord, HeartbeatStore, LeaseMonitor};
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::persistence::{JournalRecord, Persister, RecoveryStats, SequenceCounter};
use crate::slots::SlotArray;
use crate::wake::WakeNotifier;

const DEFAULT_HEARTBEAT_CAPACITY: usize = 4_096;

/// Orchestrates the in-memory structures and, when enabled, the durability
/// layer behind them. Cloneable: every field is reference-counted, so a
/// `QueueManager` can be shared with a dispatcher and an admin surface
/// without wrapping the whole thing in an extra `Arc`.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    slots: SlotArray,
    dedup: DedupIndex,
    dead_letters: DeadLetterStore,
    sequence: SequenceCounter,
    persister: Option<Persister>,
    metrics: EngineMetrics,
    wake: Arc<WakeNotifier>,
    heartbeats: HeartbeatStore,
    last_snapshot_sequence: AtomicU64,
    lease_monitor: Mutex<Option<LeaseMonitor>>,
    running: AtomicBool,
    recovery: Mutex<Option<RecoveryStats>>,
}

impl QueueManager {
    /// Build a manager from `config`, recovering from disk first when
    /// persistence is enabled.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let slots = SlotArray::new(config.capacity);
        let dedup = DedupIndex::new();
        let dead_letters = DeadLetterStore::new(config.dead_letter_capacity);

        let persister = if config.enable_persistence {
            let path = config
                .persistence_path
                .clone()
                .ok_or_else(|| Error::InvalidArgument("persistence_path required".into()))?;
            Some(Persister::open(path)?)
        } else {
            None
        };

        let mut recovery_stats = None;
        let starting_sequence = if let Some(persister) = &persister {
            let stats = persister.recover(&slots, &dedup, &dead_letters)?;
            let seq = stats.final_sequence;
            recovery_stats = Some(stats);
            seq
        } else {
            0
        };

        let inner = Inner {
            config,
            slots,
            dedup,
            dead_letters,
            sequence: SequenceCounter::starting_at(starting_sequence),
            persister,
            metrics: EngineMetrics::new(),
            wake: Arc::new(WakeNotifier::new()),
            heartbeats: HeartbeatStore::new(DEFAULT_HEARTBEAT_CAPACITY),
            last_snapshot_sequence: AtomicU64::new(starting_sequence),
            lease_monitor: Mutex::new(None),
            running: AtomicBool::new(false),
            recovery: Mutex::new(recovery_stats),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Recovery statistics captured during construction, if persistence was
    /// enabled and a prior snapshot/journal existed.
    #[must_use]
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.inner.recovery.lock().unwrap().clone()
    }

    /// Handle other subsystems (the dispatcher) wait on to learn when new
    /// work may be available.
    #[must_use]
    pub fn wake_handle(&self) -> Arc<WakeNotifier> {
        Arc::clone(&self.inner.wake)
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.inner.dead_letters
    }

    pub fn heartbeat(&self, id: MessageId, progress_pct: u8, message: Option<String>) {
        self.inner.heartbeats.heartbeat(id, progress_pct, message);
    }

    #[must_use]
    pub fn progress(&self, id: MessageId) -> Option<HeartbeatRecord> {
        self.inner.heartbeats.progress(id)
    }

    /// Start the lease monitor. Idempotent: returns `AlreadyRunning` if
    /// already started.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let manager = self.clone();
        let on_expired: Arc<crate::lease::ExpiryCallback> = Arc::new(move |id| {
            if let Err(e) = manager.reclaim_expired(id) {
                log::warn!("failed to reclaim expired lease for {id}: {e}");
            }
        });

        let scan_manager = self.clone();
        let monitor = LeaseMonitor::start(
            self.inner.config.lease_monitor_interval,
            move |now| scan_manager.inner.slots.expired_leases(now),
            on_expired,
        );
        *self.inner.lease_monitor.lock().unwrap() = Some(monitor);
        Ok(())
    }

    /// Stop the lease monitor and, if persistence is enabled, write a final
    /// snapshot. Idempotent: returns `NotRunning` if not started.
    pub fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::NotRunning);
        }
        if let Some(monitor) = self.inner.lease_monitor.lock().unwrap().take() {
            monitor.stop();
        }
        if self.inner.persister.is_some() {
            self.snapshot_now()?;
        }
        Ok(())
    }

    /// Enqueue a new message. Applies deduplication when `dedup_key` is
    /// `Some` and deduplication is enabled: a `Ready` predecessor is
    /// replaced outright, an `InFlight` predecessor is marked `Superseded`
    /// so its eventual acknowledgement is a no-op (distilled spec §4.3, §9).
    pub fn enqueue(
        &self,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        dedup_key: Option<String>,
        max_retries: Option<u32>,
        metadata: EnvelopeMetadata,
    ) -> Result<MessageId> {
        let message_type = message_type.into();
        let max_retries = max_retries.unwrap_or(self.inner.config.default_max_retries);

        // The predecessor's own terminal-state transition is journaled here,
        // ahead of the new envelope's record, so sequence numbers stay
        // monotonic with journal append order and a crash between the two
        // can't resurrect the predecessor on replay (see apply_record).
        let mut is_replace = false;
        if let (Some(key), true) = (&dedup_key, self.inner.config.enable_deduplication) {
            if let Some(existing_id) = self.inner.dedup.get(key) {
                if let Some(existing) = self.inner.slots.get(existing_id) {
                    match existing.status {
                        Status::Ready => {
                            self.inner.slots.remove(existing_id);
                            let remove_seq = self.inner.sequence.next();
                            self.persist(remove_seq, JournalRecord::remove(existing_id));
                            is_replace = true;
                        }
                        Status::InFlight => {
                            let supersede_seq = self.inner.sequence.next();
                            let superseded = self
                                .inner
                                .slots
                                .mutate(existing_id, |e| e.superseded(supersede_seq));
                            if let Some(superseded) = superseded {
                                self.persist(supersede_seq, JournalRecord::supersede((*superseded).clone()));
                            }
                            is_replace = true;
                        }
                        _ => {}
                    }
                }
            }
        }

        let sequence = self.inner.sequence.next();
        let id = MessageId::generate(sequence);
        let mut envelope = Envelope::new(
            id,
            message_type,
            payload,
            dedup_key.clone(),
            max_retries,
            metadata,
        );
        envelope.last_persisted_version = sequence;

        if !self.inner.slots.enqueue(envelope.clone()) {
            return Err(Error::QueueFull);
        }
        if let Some(key) = &dedup_key {
            if self.inner.config.enable_deduplication {
                self.inner.dedup.update(key, id);
            }
        }

        let record = if is_replace {
            JournalRecord::replace(envelope)
        } else {
            JournalRecord::enqueue(envelope)
        };
        self.persist(sequence, record);
        self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.wake.notify();
        self.maybe_snapshot();
        Ok(id)
    }

    /// Check out the next eligible `Ready` envelope of `message_type`,
    /// transitioning it to `InFlight` under a fresh lease.
    pub fn checkout(
        &self,
        message_type: &str,
        handler_id: &str,
        lease_duration: Duration,
    ) -> Option<Arc<Envelope>> {
        let now = now_ms();
        let sequence = self.inner.sequence.next();
        let lease_ms = lease_duration.as_millis() as u64;
        let result = self.inner.slots.checkout(message_type, now, |env| {
            env.checked_out(Lease::new(handler_id, lease_ms), sequence)
        });
        if let Some(env) = &result {
            if let Some(lease) = &env.lease {
                self.persist(sequence, JournalRecord::checkout(env.message_id, lease.expiry_ts));
            }
        }
        result
    }

    /// Acknowledge successful processing of `id` on behalf of `handler_id`,
    /// freeing its slot. A stale ack -- the lease already expired and was
    /// reclaimed, or the slot is now held by a different handler's checkout
    /// -- is a silent no-op rather than tearing down whoever owns it now
    /// (distilled spec §4.3). A late ack against a superseded predecessor is
    /// also a no-op, mirroring `requeue_with_backoff`, except that the dead
    /// predecessor is still cleaned up since nothing will ever check it out
    /// again.
    pub fn acknowledge(&self, id: MessageId, handler_id: &str) -> Result<()> {
        let Some(current) = self.inner.slots.get(id) else {
            return Ok(());
        };

        if current.superseded {
            self.inner.slots.remove(id);
            self.inner.heartbeats.remove(id);
            let sequence = self.inner.sequence.next();
            self.persist(sequence, JournalRecord::acknowledge(id));
            return Ok(());
        }

        let owns_lease = current.status == Status::InFlight
            && current
                .lease
                .as_ref()
                .is_some_and(|lease| lease.handler_id == handler_id);
        if !owns_lease {
            return Ok(());
        }

        let Some(removed) = self.inner.slots.remove(id) else {
            return Ok(());
        };
        if let Some(key) = &removed.dedup_key {
            self.inner.dedup.remove_if(key, id);
        }
        self.inner.heartbeats.remove(id);
        let sequence = self.inner.sequence.next();
        self.persist(sequence, JournalRecord::acknowledge(id));
        self.inner.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.maybe_snapshot();
        Ok(())
    }

    /// Requeue `id` after a failed attempt, using the queue's default
    /// backoff configuration. Dead-letters the message instead once its
    /// `max_retries` would be exceeded.
    pub fn requeue(&self, id: MessageId, failure: Option<FailureInfo>) -> Result<()> {
        let cfg = &self.inner.config;
        self.requeue_with_backoff(
            id,
            failure,
            cfg.default_backoff_strategy,
            cfg.default_initial_backoff,
            cfg.default_max_backoff,
        )
    }

    /// Requeue `id` using an explicit, handler-supplied backoff policy.
    pub fn requeue_with_backoff(
        &self,
        id: MessageId,
        failure: Option<FailureInfo>,
        backoff_strategy: BackoffStrategy,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<()> {
        let current = self
            .inner
            .slots
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown message id {id}")))?;

        if current.superseded {
            self.inner.slots.remove(id);
            self.inner.heartbeats.remove(id);
            let sequence = self.inner.sequence.next();
            self.persist(sequence, JournalRecord::acknowledge(id));
            return Ok(());
        }

        let next_retry_count = current.retry_count.saturating_add(1);
        if next_retry_count > current.max_retries {
            return self.dead_letter(id, failure);
        }

        let now = now_ms();
        let sequence = self.inner.sequence.next();
        let delay = backoff_strategy.delay(current.retry_count, initial_backoff, max_backoff);
        let not_before = now.saturating_add(delay.as_millis() as u64);

        let updated = self
            .inner
            .slots
            .mutate(id, |env| env.requeued(not_before, sequence));
        if let Some(env) = updated {
            self.persist(sequence, JournalRecord::requeue((*env).clone()));
        }
        self.inner.heartbeats.remove(id);
        self.inner.metrics.requeued.fetch_add(1, Ordering::Relaxed);
        self.inner.wake.notify();
        self.maybe_snapshot();
        Ok(())
    }

    fn dead_letter(&self, id: MessageId, failure: Option<FailureInfo>) -> Result<()> {
        let removed = self
            .inner
            .slots
            .remove(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown message id {id}")))?;
        if let Some(key) = &removed.dedup_key {
            self.inner.dedup.remove_if(key, id);
        }
        self.inner.heartbeats.remove(id);

        let failure = failure.unwrap_or_else(|| FailureInfo {
            failure_reason: "max retries exceeded".into(),
            exception_type: None,
            exception_message: None,
            stack_trace: None,
            failure_timestamp: now_ms(),
            last_handler_id: removed.lease.as_ref().map(|l| l.handler_id.clone()),
        });
        let reason = failure.failure_reason.clone();

        if !self.inner.dead_letters.add((*removed).clone(), failure) {
            log::warn!("dead-letter store full, dropping message {id}");
            return Err(Error::DeadLetterFull);
        }
        let sequence = self.inner.sequence.next();
        self.persist(sequence, JournalRecord::dead_letter(id, reason));
        self.inner
            .metrics
            .dead_lettered
            .fetch_add(1, Ordering::Relaxed);
        self.maybe_snapshot();
        Ok(())
    }

    /// Extend the lease on an `InFlight` message by `extra`.
    pub fn extend_lease(&self, id: MessageId, extra: Duration) -> Result<TimestampMs> {
        let sequence = self.inner.sequence.next();
        let extra_ms = extra.as_millis() as u64;
        let updated = self.inner.slots.mutate(id, |env| {
            let mut next = env.clone();
            if let Some(lease) = &mut next.lease {
                lease.expiry_ts = lease.expiry_ts.saturating_add(extra_ms);
                lease.extension_count = lease.extension_count.saturating_add(1);
            }
            next.last_persisted_version = sequence;
            next
        });

        match updated {
            Some(env) => match &env.lease {
                Some(lease) => {
                    self.persist(sequence, JournalRecord::lease_renew(id, lease.expiry_ts));
                    Ok(lease.expiry_ts)
                }
                None => Err(Error::LeaseLost),
            },
            None => Err(Error::InvalidArgument(format!("unknown message id {id}"))),
        }
    }

    /// Called by the lease monitor for each envelope whose lease has
    /// expired. Requeues using the queue's default backoff.
    fn reclaim_expired(&self, id: MessageId) -> Result<()> {
        self.requeue(id, Some(FailureInfo {
            failure_reason: "lease expired".into(),
            exception_type: None,
            exception_message: None,
            stack_trace: None,
            failure_timestamp: now_ms(),
            last_handler_id: None,
        }))
    }

    #[must_use]
    pub fn get_message(&self, id: MessageId) -> Option<Arc<Envelope>> {
        self.inner.slots.get(id)
    }

    #[must_use]
    pub fn get_count(&self) -> usize {
        self.inner.slots.count()
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<Envelope>> {
        self.inner.slots.list_all()
    }

    /// Replay a dead-lettered message back into the main store as `Ready`.
    pub fn replay_dead_letter(&self, id: MessageId) -> Result<()> {
        let dead = self
            .inner
            .dead_letters
            .take(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no dead letter {id}")))?;
        let mut envelope = dead.envelope;
        envelope.status = Status::Ready;
        envelope.retry_count = 0;
        envelope.lease = None;
        envelope.superseded = false;
        envelope.not_before = None;

        if !self.inner.slots.enqueue(envelope.clone()) {
            // put it back; the main store had no room.
            self.inner.dead_letters.add(envelope.clone(), dead.failure);
            return Err(Error::QueueFull);
        }
        if let Some(key) = &envelope.dedup_key {
            self.inner.dedup.update(key, id);
        }
        let sequence = self.inner.sequence.next();
        self.persist(sequence, JournalRecord::dead_letter_replay(envelope));
        self.inner.wake.notify();
        Ok(())
    }

    /// Purge dead letters older than `older_than`, or all of them if `None`.
    pub fn purge_dead_letters(&self, older_than: Option<u64>) -> usize {
        let purged = self.inner.dead_letters.purge(older_than);
        let sequence = self.inner.sequence.next();
        self.persist(sequence, JournalRecord::dead_letter_purge(older_than));
        purged
    }

    /// Force a snapshot write right now, regardless of the configured
    /// threshold/interval.
    pub fn snapshot_now(&self) -> Result<()> {
        let Some(persister) = &self.inner.persister else {
            return Ok(());
        };
        let version = self.inner.sequence.current();
        persister.snapshot_now(version, &self.inner.slots, &self.inner.dedup, &self.inner.dead_letters)?;
        self.inner
            .last_snapshot_sequence
            .store(version, Ordering::Relaxed);
        self.inner
            .metrics
            .snapshots_written
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn maybe_snapshot(&self) {
        if self.inner.persister.is_none() {
            return;
        }
        let current = self.inner.sequence.current();
        let last = self.inner.last_snapshot_sequence.load(Ordering::Relaxed);
        if current.saturating_sub(last) >= self.inner.config.snapshot_threshold {
            if let Err(e) = self.snapshot_now() {
                log::warn!("threshold snapshot failed: {e}");
                self.inner
                    .metrics
                    .journal_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Append `record` under `sequence` -- the exact sequence number baked
    /// into the record (e.g. its envelope's `last_persisted_version`), never
    /// re-derived from the shared counter, which may have advanced past it
    /// by the time this call runs (distilled spec §4.7, I5).
    fn persist(&self, sequence: u64, record: JournalRecord) {
        let Some(persister) = &self.inner.persister else {
            return;
        };
        if let Err(e) = persister.append(sequence, &record) {
            log::warn!("journal append failed for sequence {sequence}: {e}");
            self.inner
                .metrics
                .journal_errors
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> QueueConfig {
        QueueConfig::builder()
            .capacity(crate::config::MIN_CAPACITY)
            .dead_letter_capacity(crate::config::MIN_DEAD_LETTER_CAPACITY)
            .enable_persistence(true)
            .persistence_path(dir.to_path_buf())
            .build()
            .unwrap()
    }

    fn no_persistence_config() -> QueueConfig {
        QueueConfig::builder()
            .capacity(crate::config::MIN_CAPACITY)
            .dead_letter_capacity(crate::config::MIN_DEAD_LETTER_CAPACITY)
            .enable_persistence(false)
            .default_initial_backoff(Duration::ZERO)
            .default_max_backoff(Duration::ZERO)
            .build()
            .unwrap()
    }

    #[test]
    fn enqueue_fails_once_capacity_is_reached() {
        let manager = QueueManager::new(no_persistence_config()).unwrap();
        for _ in 0..crate::config::MIN_CAPACITY {
            manager
                .enqueue("t", vec![1], None, None, EnvelopeMetadata::default())
                .unwrap();
        }
        let result = manager.enqueue("t", vec![1], None, None, EnvelopeMetadata::default());
        assert!(matches!(result, Err(Error::QueueFull)));
    }

    #[test]
    fn dedup_replaces_ready_predecessor_outright() {
        let manager = QueueManager::new(no_persistence_config()).unwrap();
        let first = manager
            .enqueue("t", vec![1], Some("k".into()), None, EnvelopeMetadata::default())
            .unwrap();
        let second = manager
            .enqueue("t", vec![2], Some("k".into()), None, EnvelopeMetadata::default())
            .unwrap();

        assert!(manager.get_message(first).is_none());
        assert_eq!(manager.get_count(), 1);
        assert_eq!(manager.get_message(second).unwrap().payload, vec![2]);
    }

    #[test]
    fn dedup_supersedes_inflight_predecessor() {
        let manager = QueueManager::new(no_persistence_config()).unwrap();
        let first = manager
            .enqueue("t", vec![1], Some("k".into()), None, EnvelopeMetadata::default())
            .unwrap();
        manager
            .checkout("t", "h1", Duration::from_secs(30))
            .unwrap();

        let second = manager
            .enqueue("t", vec![2], Some("k".into()), None, EnvelopeMetadata::default())
            .unwrap();

        let predecessor = manager.get_message(first).unwrap();
        assert!(predecessor.superseded);
        assert_eq!(manager.get_message(second).unwrap().payload, vec![2]);

        // The late acknowledgement of the superseded predecessor is a no-op.
        manager.acknowledge(first, "h1").unwrap();
        assert!(manager.get_message(first).is_none());
    }

    #[test]
    fn stale_ack_after_lease_reclaim_does_not_clobber_the_new_holder() {
        let manager = QueueManager::new(no_persistence_config()).unwrap();
        let id = manager
            .enqueue("t", vec![1], None, None, EnvelopeMetadata::default())
            .unwrap();
        manager
            .checkout("t", "h1", Duration::from_secs(30))
            .unwrap();

        // h1's lease is reclaimed (e.g. by the lease monitor) and requeued
        // back to Ready, then h2 checks it out under a fresh lease.
        manager.requeue(id, None).unwrap();
        manager
            .checkout("t", "h2", Duration::from_secs(30))
            .unwrap();

        // h1, unaware its lease was reclaimed, finally acks -- this must not
        // remove h2's in-flight message.
        manager.acknowledge(id, "h1").unwrap();
        let still_inflight = manager.get_message(id).unwrap();
        assert_eq!(still_inflight.status, Status::InFlight);
        assert_eq!(still_inflight.lease.as_ref().unwrap().handler_id, "h2");

        manager.acknowledge(id, "h2").unwrap();
        assert!(manager.get_message(id).is_none());
    }

    #[test]
    fn requeue_dead_letters_after_max_retries_exceeded() {
        let manager = QueueManager::new(no_persistence_config()).unwrap();
        let id = manager
            .enqueue("t", vec![1], None, Some(2), EnvelopeMetadata::default())
            .unwrap();

        for _ in 0..2 {
            manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
            manager.requeue(id, None).unwrap();
        }
        manager.checkout("t", "h1", Duration::from_secs(30)).unwrap();
        manager.requeue(id, None).unwrap();

        assert!(manager.get_message(id).is_none());
        assert_eq!(manager.dead_letters().len(), 1);
    }

    #[test]
    fn snapshot_and_journal_recover_full_state_across_restart() {
        let dir = tempdir().unwrap();
        let manager = QueueManager::new(config(dir.path())).unwrap();
        let id = manager
            .enqueue("t", vec![7], None, None, EnvelopeMetadata::default())
            .unwrap();
        manager.snapshot_now().unwrap();
        manager
            .enqueue("t", vec![8], None, None, EnvelopeMetadata::default())
            .unwrap();

        drop(manager);

        let recovered = QueueManager::new(config(dir.path())).unwrap();
        assert_eq!(recovered.get_count(), 2);
        assert_eq!(recovered.get_message(id).unwrap().payload, vec![7]);
        let stats = recovered.recovery_stats().unwrap();
        assert_eq!(stats.messages_restored, 1);
        assert_eq!(stats.journal_ops_replayed, 1);
    }
}

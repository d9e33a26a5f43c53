// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Persistence: write-ahead journal, atomic snapshots, and crash recovery
//! (distilled spec §4.7).

pub mod journal;
pub mod record;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dead_letter::DeadLetterStore;
use crate::dedup::DedupIndex;
use crate::envelope::{now_ms, FailureInfo, Status, TimestampMs};
use crate::error::Result;
use crate::slots::SlotArray;

pub use journal::Journal;
pub use record::{JournalRecord, OpCode};

const JOURNAL_FILE: &str = "journal.dat";
const SNAPSHOT_FILE: &str = "snapshot.dat";

/// Outcome of a [`Persister::recover`] call, surfaced to callers for logging
/// and startup diagnostics (distilled spec §4.7, closing paragraph).
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub started_at: TimestampMs,
    pub finished_at: TimestampMs,
    pub snapshot_version: u64,
    pub messages_restored: usize,
    pub dedup_entries_restored: usize,
    pub dead_letters_restored: usize,
    pub journal_ops_replayed: usize,
    pub leases_reclaimed: usize,
    pub final_sequence: u64,
}

/// Ties the journal and snapshot files together into one durability unit.
pub struct Persister {
    journal: Journal,
    snapshot_path: PathBuf,
}

impl Persister {
    /// Open (creating if absent) the journal and snapshot files under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            journal: Journal::open(dir.join(JOURNAL_FILE))?,
            snapshot_path: dir.join(SNAPSHOT_FILE),
        })
    }

    /// Append one record to the journal, flushing before returning.
    pub fn append(&self, sequence: u64, record: &JournalRecord) -> Result<()> {
        self.journal.append(sequence, record)
    }

    /// Write a fresh snapshot covering up through `version`, then truncate
    /// the journal prefix it now makes redundant.
    pub fn snapshot_now(
        &self,
        version: u64,
        slots: &SlotArray,
        dedup: &DedupIndex,
        dead_letters: &DeadLetterStore,
    ) -> Result<()> {
        snapshot::write_snapshot(&self.snapshot_path, version, slots, dedup, dead_letters)?;
        self.journal.truncate_through(version)
    }

    /// Restore in-memory state from the last snapshot (if any) plus every
    /// journal record after it, in order.
    ///
    /// Procedure (distilled spec §4.7):
    /// 1. Load the snapshot, if present, restoring slots/dedup/dead-letters.
    /// 2. Replay journal records past the snapshot's watermark, applying
    ///    each op. `Checkout`/`LeaseRenew` are stale by the time a crash is
    ///    observed and are skipped; everything else re-establishes state.
    /// 3. Rehydrate the sequence counter from the highest sequence seen.
    /// 4. Prune dedup entries pointing at absent or non-live envelopes.
    /// 5. Requeue any `InFlight` envelope whose lease had already expired.
    pub fn recover(
        &self,
        slots: &SlotArray,
        dedup: &DedupIndex,
        dead_letters: &DeadLetterStore,
    ) -> Result<RecoveryStats> {
        let started_at = now_ms();
        let mut stats = RecoveryStats {
            started_at,
            ..Default::default()
        };

        let snapshot_version = if let Some(loaded) = snapshot::read_snapshot(&self.snapshot_path)? {
            stats.snapshot_version = loaded.version;
            stats.messages_restored = loaded.messages.len();
            stats.dedup_entries_restored = loaded.dedup_index.len();
            stats.dead_letters_restored = loaded.dead_letter_messages.len();

            for envelope in loaded.messages {
                slots.restore(envelope);
            }
            dedup.restore(loaded.dedup_index);
            dead_letters.restore(loaded.dead_letter_messages);
            loaded.version
        } else {
            0
        };

        let mut final_sequence = snapshot_version;
        let replayed = self.journal.replay(snapshot_version)?;
        stats.journal_ops_replayed = replayed.len();

        for (sequence, record) in replayed {
            final_sequence = final_sequence.max(sequence);
            apply_record(slots, dedup, dead_letters, &record);
        }

        let absent_keys: Vec<String> = dedup
            .snapshot()
            .into_iter()
            .filter(|(_, id)| match slots.get(*id) {
                Some(env) => !matches!(env.status, Status::Ready | Status::InFlight),
                None => true,
            })
            .map(|(key, _)| key)
            .collect();
        for key in absent_keys {
            dedup.remove(&key);
        }

        let now = now_ms();
        let expired = slots.expired_leases(now);
        stats.leases_reclaimed = expired.len();
        for id in expired {
            final_sequence += 1;
            slots.mutate(id, |env| env.requeued(now, final_sequence));
        }

        stats.final_sequence = final_sequence;
        stats.finished_at = now_ms();
        log::info!(
            "recovery complete: snapshot_version={} messages_restored={} journal_ops_replayed={} leases_reclaimed={}",
            stats.snapshot_version,
            stats.messages_restored,
            stats.journal_ops_replayed,
            stats.leases_reclaimed,
        );
        Ok(stats)
    }
}

fn apply_record(
    slots: &SlotArray,
    dedup: &DedupIndex,
    dead_letters: &DeadLetterStore,
    record: &JournalRecord,
) {
    match record.op {
        OpCode::Enqueue | OpCode::Replace => {
            if let Some(envelope) = &record.envelope {
                slots.remove(envelope.message_id);
                slots.restore(envelope.clone());
                if let Some(key) = &envelope.dedup_key {
                    dedup.update(key, envelope.message_id);
                }
            }
        }
        OpCode::Requeue | OpCode::Fail => {
            if let Some(envelope) = &record.envelope {
                slots.remove(envelope.message_id);
                slots.restore(envelope.clone());
            }
        }
        OpCode::Acknowledge | OpCode::Remove => {
            if let Some(removed) = slots.remove(record.message_id) {
                if let Some(key) = &removed.dedup_key {
                    dedup.remove_if(key, record.message_id);
                }
            }
        }
        OpCode::Supersede => {
            if let Some(envelope) = &record.envelope {
                slots.remove(envelope.message_id);
                slots.restore(envelope.clone());
            }
        }
        OpCode::DeadLetter => {
            if let Some(removed) = slots.remove(record.message_id) {
                if let Some(key) = &removed.dedup_key {
                    dedup.remove_if(key, record.message_id);
                }
                let failure = FailureInfo {
                    failure_reason: record.payload_string.clone().unwrap_or_default(),
                    exception_type: None,
                    exception_message: None,
                    stack_trace: None,
                    failure_timestamp: record.timestamp,
                    last_handler_id: removed.lease.as_ref().map(|l| l.handler_id.clone()),
                };
                dead_letters.add((*removed).clone(), failure);
            }
        }
        OpCode::DeadLetterReplay => {
            if let Some(envelope) = &record.envelope {
                dead_letters.take(envelope.message_id);
                slots.restore(envelope.clone());
                if let Some(key) = &envelope.dedup_key {
                    dedup.update(key, envelope.message_id);
                }
            }
        }
        OpCode::DeadLetterPurge => {
            let cutoff = record
                .payload_string
                .as_ref()
                .and_then(|s| s.parse::<TimestampMs>().ok());
            dead_letters.purge(cutoff);
        }
        OpCode::Checkout | OpCode::LeaseRenew => {
            // Lease state is stale by the time a crash is observed; the
            // expired-lease scan after replay reclaims anything still
            // InFlight, so these ops are intentionally no-ops here.
        }
    }
}

/// Monotonic journal sequence counter, shared between the persister's
/// callers and recovery's rehydration step.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    #[must_use]
    pub fn starting_at(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeMetadata, Lease, MessageId};
    use tempfile::tempdir;

    #[test]
    fn recover_replays_enqueue_after_snapshot() {
        let dir = tempdir().unwrap();
        let persister = Persister::open(dir.path()).unwrap();

        let slots = SlotArray::new(8);
        let dedup = DedupIndex::new();
        let dlq = DeadLetterStore::new(8);

        let env1 = Envelope::new(MessageId::generate(1), "t", vec![1], None, 3, EnvelopeMetadata::default());
        persister.snapshot_now(0, &slots, &dedup, &dlq).unwrap();

        let env2 = Envelope::new(MessageId::generate(2), "t", vec![2], None, 3, EnvelopeMetadata::default());
        persister.append(1, &JournalRecord::enqueue(env1.clone())).unwrap();
        persister.append(2, &JournalRecord::enqueue(env2.clone())).unwrap();

        let fresh_slots = SlotArray::new(8);
        let fresh_dedup = DedupIndex::new();
        let fresh_dlq = DeadLetterStore::new(8);
        let stats = persister.recover(&fresh_slots, &fresh_dedup, &fresh_dlq).unwrap();

        assert_eq!(stats.journal_ops_replayed, 2);
        assert_eq!(fresh_slots.count(), 2);
        assert_eq!(stats.final_sequence, 2);
    }

    #[test]
    fn recover_reclaims_expired_inflight_lease() {
        let dir = tempdir().unwrap();
        let persister = Persister::open(dir.path()).unwrap();

        let slots = SlotArray::new(4);
        let dedup = DedupIndex::new();
        let dlq = DeadLetterStore::new(4);

        let env = Envelope::new(MessageId::generate(1), "t", vec![1], None, 3, EnvelopeMetadata::default());
        let checked_out = env.checked_out(Lease::new("h1", 1), 1);
        persister.append(1, &JournalRecord::enqueue(checked_out)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));

        let fresh_slots = SlotArray::new(4);
        let fresh_dedup = DedupIndex::new();
        let fresh_dlq = DeadLetterStore::new(4);
        let stats = persister.recover(&fresh_slots, &fresh_dedup, &fresh_dlq).unwrap();

        assert_eq!(stats.leases_reclaimed, 1);
        let restored = fresh_slots.list_all();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].status, Status::Ready);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dead-letter store: a secondary bounded container for envelopes that
//! exhausted their retries, with failure metadata and replay (distilled
//! spec §4.5).

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::envelope::{DeadLetterEnvelope, Envelope, FailureInfo, MessageId, TimestampMs};

/// Aggregate counters returned by [`DeadLetterStore::metrics`].
#[derive(Debug, Clone, Default)]
pub struct DeadLetterMetrics {
    pub total_count: usize,
    pub count_by_type: Vec<(String, usize)>,
    pub oldest_timestamp: Option<TimestampMs>,
}

/// Bounded store of [`DeadLetterEnvelope`]s, indexed by id.
///
/// Capacity is enforced on insert: once full, new arrivals are dropped
/// rather than wedging the main queue (distilled spec §4.5), and the drop
/// is reported back to the caller so it can be surfaced to telemetry.
pub struct DeadLetterStore {
    capacity: usize,
    entries: DashMap<MessageId, DeadLetterEnvelope>,
    /// Insertion order, used for capacity accounting and `oldest_timestamp`.
    order: Mutex<VecDeque<MessageId>>,
}

impl DeadLetterStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Insert a dead-lettered envelope. Returns `false` (without inserting)
    /// if the store is already at capacity.
    pub fn add(&self, envelope: Envelope, failure: FailureInfo) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        let id = envelope.message_id;
        self.entries
            .insert(id, DeadLetterEnvelope { envelope, failure });
        self.order.lock().unwrap().push_back(id);
        true
    }

    /// Remove and return a dead-lettered envelope by id, for replay.
    pub fn take(&self, id: MessageId) -> Option<DeadLetterEnvelope> {
        let removed = self.entries.remove(&id).map(|(_, v)| v);
        if removed.is_some() {
            let mut order = self.order.lock().unwrap();
            order.retain(|x| *x != id);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<DeadLetterEnvelope> {
        self.entries.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<DeadLetterEnvelope> {
        self.entries.iter().map(|r| r.value().clone()).collect()
    }

    /// Replace the store's contents with `entries`, restoring insertion
    /// order. Used only during snapshot load (distilled spec §4.7).
    pub fn restore(&self, entries: Vec<DeadLetterEnvelope>) {
        self.entries.clear();
        let mut order = self.order.lock().unwrap();
        order.clear();
        for entry in entries {
            let id = entry.message_id();
            self.entries.insert(id, entry);
            order.push_back(id);
        }
    }

    /// Drop entries whose `failure_timestamp` is older than `older_than`, or
    /// every entry if `older_than` is `None`. Returns the number purged.
    pub fn purge(&self, older_than: Option<TimestampMs>) -> usize {
        let ids: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|r| match older_than {
                Some(cutoff) => r.value().failure.failure_timestamp < cutoff,
                None => true,
            })
            .map(|r| *r.key())
            .collect();

        for id in &ids {
            self.entries.remove(id);
        }
        let mut order = self.order.lock().unwrap();
        order.retain(|id| !ids.contains(id));
        ids.len()
    }

    #[must_use]
    pub fn metrics(&self) -> DeadLetterMetrics {
        let mut by_type: std::collections::BTreeMap<String, usize> =
            std::collections::BTreeMap::new();
        let mut oldest: Option<TimestampMs> = None;

        for entry in self.entries.iter() {
            *by_type
                .entry(entry.value().envelope.message_type.clone())
                .or_insert(0) += 1;
            let ts = entry.value().failure.failure_timestamp;
            oldest = Some(oldest.map_or(ts, |cur| cur.min(ts)));
        }

        DeadLetterMetrics {
            total_count: self.entries.len(),
            count_by_type: by_type.into_iter().collect(),
            oldest_timestamp: oldest,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

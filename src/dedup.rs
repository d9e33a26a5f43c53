// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deduplication index: dedup key -> owning message id.
//!
//! Backed by `DashMap` for lock-free concurrent insert/update/remove, the
//! same way the runtime configuration store elsewhere in this crate lineage
//! uses `DashMap` instead of a mutex-guarded `HashMap`. The index is
//! advisory only -- the slot array remains authoritative (distilled spec §4.2).

use dashmap::DashMap;

use crate::envelope::MessageId;

/// Lock-free `dedup_key -> message_id` index.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: DashMap<String, MessageId>,
}

impl DedupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert iff the key is absent. Returns `true` if inserted.
    pub fn try_add(&self, key: &str, id: MessageId) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    /// Unconditionally overwrite the mapping for `key`.
    pub fn update(&self, key: &str, id: MessageId) {
        self.entries.insert(key.to_string(), id);
    }

    /// Remove the mapping for `key`, if any.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Look up the current owner of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<MessageId> {
        self.entries.get(key).map(|r| *r.value())
    }

    /// Remove the mapping for `key` only if it currently points at `expected`.
    ///
    /// Used by the queue manager to avoid dropping a dedup entry that has
    /// already been reassigned to a newer message between read and remove.
    pub fn remove_if(&self, key: &str, expected: MessageId) {
        self.entries.remove_if(key, |_, v| *v == expected);
    }

    /// Point-in-time copy suitable for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, MessageId)> {
        self.entries
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect()
    }

    /// Clear and repopulate from a restored snapshot.
    pub fn restore(&self, entries: Vec<(String, MessageId)>) {
        self.entries.clear();
        for (key, id) in entries {
            self.entries.insert(key, id);
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> MessageId {
        MessageId::generate(n)
    }

    #[test]
    fn try_add_rejects_existing_key() {
        let index = DedupIndex::new();
        assert!(index.try_add("k", id(1)));
        assert!(!index.try_add("k", id(2)));
        assert_eq!(index.get("k"), Some(id(1)));
    }

    #[test]
    fn update_overwrites_unconditionally() {
        let index = DedupIndex::new();
        index.update("k", id(1));
        index.update("k", id(2));
        assert_eq!(index.get("k"), Some(id(2)));
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let index = DedupIndex::new();
        index.update("a", id(1));
        index.update("b", id(2));
        let snap = index.snapshot();

        let restored = DedupIndex::new();
        restored.restore(snap);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("a"), Some(id(1)));
    }
}

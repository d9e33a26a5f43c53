// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Slot array: the fixed-capacity, lock-free source of truth for in-memory
//! envelope state (distilled spec §4.1).
//!
//! Each cell holds an `Option<Arc<Envelope>>` published via `ArcSwapOption`,
//! the same atomic-swap primitive the runtime configuration store elsewhere
//! in this crate lineage uses in place of a lock. Envelopes are immutable
//! once published; every transition builds a fresh snapshot and publishes it
//! through `rcu`, which retries the read-modify-write internally whenever a
//! competing writer wins the race -- exactly the "retry on CAS failure and
//! re-scan" rule distilled spec §4.1 requires, without a hand-rolled retry loop.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::envelope::{Envelope, MessageId, Status, TimestampMs};

/// One cell of the slot array.
struct Slot {
    cell: ArcSwapOption<Envelope>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            cell: ArcSwapOption::from(None),
        }
    }
}

/// Fixed-capacity, lock-free array of optional envelopes.
///
/// Scans are linear in capacity; cursors are hints only, never relied on
/// for correctness (distilled spec §4.1).
pub struct SlotArray {
    slots: Vec<Slot>,
    write_cursor: AtomicUsize,
    read_cursor: AtomicUsize,
}

impl SlotArray {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            slots,
            write_cursor: AtomicUsize::new(0),
            read_cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first empty cell found on a single scan starting at the
    /// write cursor, publishing `env` there. Returns `false` only if every
    /// cell is occupied by a non-empty envelope on a full pass.
    pub fn enqueue(&self, env: Envelope) -> bool {
        let n = self.slots.len();
        if n == 0 {
            return false;
        }
        let start = self.write_cursor.load(Ordering::Relaxed) % n;
        let target = Arc::new(env);

        for offset in 0..n {
            let idx = (start + offset) % n;
            let claimed = Cell::new(false);
            self.slots[idx].cell.rcu(|current| {
                if current.is_none() {
                    claimed.set(true);
                    Some(Arc::clone(&target))
                } else {
                    claimed.set(false);
                    current.clone()
                }
            });
            if claimed.get() {
                self.write_cursor.store((idx + 1) % n, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Like `enqueue`, but preserves whatever status the envelope already
    /// carries. Used only during recovery replay (distilled spec §4.1 `restore`).
    pub fn restore(&self, env: Envelope) -> bool {
        self.enqueue(env)
    }

    /// Scan for the first cell whose envelope matches `type_tag`, is
    /// `Ready`, not superseded, and past its `not_before`. Publish the
    /// result of `build` in its place and return the new snapshot.
    pub fn checkout<F>(&self, type_tag: &str, now: TimestampMs, build: F) -> Option<Arc<Envelope>>
    where
        F: Fn(&Envelope) -> Envelope,
    {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }
        let start = self.read_cursor.load(Ordering::Relaxed) % n;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let claimed: Cell<Option<Arc<Envelope>>> = Cell::new(None);
            self.slots[idx].cell.rcu(|current| match current {
                Some(env) if env.is_eligible(type_tag, now) => {
                    let next = Arc::new(build(env));
                    claimed.set(Some(Arc::clone(&next)));
                    Some(next)
                }
                other => {
                    claimed.set(None);
                    other.clone()
                }
            });
            if let Some(next) = claimed.into_inner() {
                self.read_cursor.store((idx + 1) % n, Ordering::Relaxed);
                return Some(next);
            }
        }
        None
    }

    /// Locate the cell holding `id` and publish the result of `build` in its
    /// place. Returns the published snapshot, or `None` if `id` is absent.
    pub fn mutate<F>(&self, id: MessageId, build: F) -> Option<Arc<Envelope>>
    where
        F: Fn(&Envelope) -> Envelope,
    {
        for slot in &self.slots {
            if slot
                .cell
                .load()
                .as_ref()
                .is_none_or_not_matching(id)
            {
                continue;
            }
            let claimed: Cell<Option<Arc<Envelope>>> = Cell::new(None);
            slot.cell.rcu(|current| match current {
                Some(env) if env.message_id == id => {
                    let next = Arc::new(build(env));
                    claimed.set(Some(Arc::clone(&next)));
                    Some(next)
                }
                other => other.clone(),
            });
            if let Some(next) = claimed.into_inner() {
                return Some(next);
            }
        }
        None
    }

    /// Swap the cell holding `id` to empty, regardless of its current status
    /// (used by acknowledge, dead-letter routing, and recovery GC).
    pub fn remove(&self, id: MessageId) -> Option<Arc<Envelope>> {
        for slot in &self.slots {
            let claimed: Cell<Option<Arc<Envelope>>> = Cell::new(None);
            slot.cell.rcu(|current| match current {
                Some(env) if env.message_id == id => {
                    claimed.set(Some(Arc::clone(env)));
                    None
                }
                other => other.clone(),
            });
            if let Some(removed) = claimed.into_inner() {
                return Some(removed);
            }
        }
        None
    }

    /// Find the live (Ready/InFlight) envelope owning `dedup_key`, if any.
    #[must_use]
    pub fn find_by_dedup_key(&self, dedup_key: &str) -> Option<Arc<Envelope>> {
        for slot in &self.slots {
            if let Some(env) = slot.cell.load().as_ref() {
                if env.dedup_key.as_deref() == Some(dedup_key)
                    && matches!(env.status, Status::Ready | Status::InFlight)
                {
                    return Some(Arc::clone(env));
                }
            }
        }
        None
    }

    /// Look up the current snapshot for `id`.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Arc<Envelope>> {
        for slot in &self.slots {
            if let Some(env) = slot.cell.load().as_ref() {
                if env.message_id == id {
                    return Some(Arc::clone(env));
                }
            }
        }
        None
    }

    /// Number of occupied (non-empty) cells.
    #[must_use]
    pub fn count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.cell.load().is_some())
            .count()
    }

    /// Snapshot every occupied envelope (used by persistence and admin views).
    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<Envelope>> {
        self.slots
            .iter()
            .filter_map(|s| s.cell.load().as_ref().map(Arc::clone))
            .collect()
    }

    /// Scan for all `InFlight` envelopes whose lease has expired as of `now`.
    #[must_use]
    pub fn expired_leases(&self, now: TimestampMs) -> Vec<MessageId> {
        self.slots
            .iter()
            .filter_map(|s| {
                let guard = s.cell.load();
                let env = guard.as_ref()?;
                if env.status == Status::InFlight {
                    if let Some(lease) = &env.lease {
                        if lease.is_expired(now) {
                            return Some(env.message_id);
                        }
                    }
                }
                None
            })
            .collect()
    }
}

/// Small helper trait so `mutate`'s pre-filter reads like the eligibility
/// checks elsewhere in this module.
trait NotMatching {
    fn is_none_or_not_matching(&self, id: MessageId) -> bool;
}

impl NotMatching for Option<&Arc<Envelope>> {
    fn is_none_or_not_matching(&self, id: MessageId) -> bool {
        !matches!(self, Some(env) if env.message_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeMetadata;

    fn env(n: u64, msg_type: &str) -> Envelope {
        Envelope::new(
            MessageId::generate(n),
            msg_type,
            vec![1, 2, 3],
            None,
            3,
            EnvelopeMetadata::default(),
        )
    }

    #[test]
    fn enqueue_fails_when_full() {
        let slots = SlotArray::new(2);
        assert!(slots.enqueue(env(1, "t")));
        assert!(slots.enqueue(env(2, "t")));
        assert!(!slots.enqueue(env(3, "t")));
        assert_eq!(slots.count(), 2);
    }

    #[test]
    fn checkout_only_matches_ready_of_type() {
        let slots = SlotArray::new(4);
        slots.enqueue(env(1, "a"));
        slots.enqueue(env(2, "b"));

        let out = slots.checkout("b", 0, |e| {
            e.checked_out(crate::envelope::Lease::new("h1", 1000), 1)
        });
        assert!(out.is_some());
        assert_eq!(out.unwrap().message_type, "b");

        // b is now InFlight, should not match again
        let out2 = slots.checkout("b", 0, |e| {
            e.checked_out(crate::envelope::Lease::new("h1", 1000), 2)
        });
        assert!(out2.is_none());
    }

    #[test]
    fn remove_frees_the_slot() {
        let slots = SlotArray::new(2);
        slots.enqueue(env(1, "t"));
        let id = slots.list_all()[0].message_id;
        assert!(slots.remove(id).is_some());
        assert_eq!(slots.count(), 0);
    }
}

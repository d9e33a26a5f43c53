// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Journal record encoding (distilled spec §4.7).
//!
//! Each journal record is a fixed binary header (sequence, length, CRC32)
//! followed by a JSON-encoded payload. JSON keeps the payload
//! self-describing and forward-compatible with unknown fields, the way
//! `hdds-persistence`'s durability service exchanges records with its
//! storage backends -- the same idiom, applied to our own wire format
//! instead of pulling in that service's SQLite dependency.

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, MessageId, TimestampMs};

/// Operation codes, matching distilled spec §4.7 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    Enqueue = 1,
    Replace = 2,
    Checkout = 3,
    Acknowledge = 4,
    Fail = 5,
    DeadLetter = 6,
    LeaseRenew = 7,
    Requeue = 8,
    DeadLetterReplay = 9,
    DeadLetterPurge = 10,
    /// A dedup-replaced `InFlight` predecessor transitioning to `Superseded`.
    Supersede = 11,
    /// A dedup-replaced `Ready` predecessor removed outright.
    Remove = 12,
}

/// One self-describing journal payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub op: OpCode,
    pub message_id: MessageId,
    /// Full envelope snapshot, present for ops that (re)establish an
    /// envelope's state: `Enqueue`, `Replace`, `Requeue`, `Supersede`.
    pub envelope: Option<Envelope>,
    /// New lease expiry, present only for `LeaseRenew`.
    pub lease_expiry: Option<TimestampMs>,
    /// Free-form context (failure reason, purge cutoff), present only when
    /// the op needs it.
    pub payload_string: Option<String>,
    pub timestamp: TimestampMs,
}

impl JournalRecord {
    #[must_use]
    pub fn enqueue(envelope: Envelope) -> Self {
        Self {
            op: OpCode::Enqueue,
            message_id: envelope.message_id,
            timestamp: crate::envelope::now_ms(),
            envelope: Some(envelope),
            lease_expiry: None,
            payload_string: None,
        }
    }

    #[must_use]
    pub fn replace(envelope: Envelope) -> Self {
        Self {
            op: OpCode::Replace,
            message_id: envelope.message_id,
            timestamp: crate::envelope::now_ms(),
            envelope: Some(envelope),
            lease_expiry: None,
            payload_string: None,
        }
    }

    #[must_use]
    pub fn checkout(message_id: MessageId, lease_expiry: TimestampMs) -> Self {
        Self {
            op: OpCode::Checkout,
            message_id,
            envelope: None,
            lease_expiry: Some(lease_expiry),
            payload_string: None,
            timestamp: crate::envelope::now_ms(),
        }
    }

    #[must_use]
    pub fn acknowledge(message_id: MessageId) -> Self {
        Self {
            op: OpCode::Acknowledge,
            message_id,
            envelope: None,
            lease_expiry: None,
            payload_string: None,
            timestamp: crate::envelope::now_ms(),
        }
    }

    #[must_use]
    pub fn requeue(envelope: Envelope) -> Self {
        Self {
            op: OpCode::Requeue,
            message_id: envelope.message_id,
            timestamp: crate::envelope::now_ms(),
            envelope: Some(envelope),
            lease_expiry: None,
            payload_string: None,
        }
    }

    #[must_use]
    pub fn dead_letter(message_id: MessageId, reason: String) -> Self {
        Self {
            op: OpCode::DeadLetter,
            message_id,
            envelope: None,
            lease_expiry: None,
            payload_string: Some(reason),
            timestamp: crate::envelope::now_ms(),
        }
    }

    #[must_use]
    pub fn lease_renew(message_id: MessageId, new_expiry: TimestampMs) -> Self {
        Self {
            op: OpCode::LeaseRenew,
            message_id,
            envelope: None,
            lease_expiry: Some(new_expiry),
            payload_string: None,
            timestamp: crate::envelope::now_ms(),
        }
    }

    #[must_use]
    pub fn dead_letter_replay(envelope: Envelope) -> Self {
        Self {
            op: OpCode::DeadLetterReplay,
            message_id: envelope.message_id,
            timestamp: crate::envelope::now_ms(),
            envelope: Some(envelope),
            lease_expiry: None,
            payload_string: None,
        }
    }

    /// An `InFlight` dedup predecessor transitioning to `Superseded` outside
    /// of its own enqueue/requeue record; `envelope` carries the already
    /// `Superseded` snapshot so replay doesn't need to re-derive it.
    #[must_use]
    pub fn supersede(envelope: Envelope) -> Self {
        Self {
            op: OpCode::Supersede,
            message_id: envelope.message_id,
            timestamp: crate::envelope::now_ms(),
            envelope: Some(envelope),
            lease_expiry: None,
            payload_string: None,
        }
    }

    /// A `Ready` dedup predecessor dropped outright to make room for its
    /// replacement.
    #[must_use]
    pub fn remove(message_id: MessageId) -> Self {
        Self {
            op: OpCode::Remove,
            message_id,
            envelope: None,
            lease_expiry: None,
            payload_string: None,
            timestamp: crate::envelope::now_ms(),
        }
    }

    #[must_use]
    pub fn dead_letter_purge(cutoff: Option<TimestampMs>) -> Self {
        Self {
            op: OpCode::DeadLetterPurge,
            message_id: MessageId([0u8; 16]),
            envelope: None,
            lease_expiry: None,
            payload_string: cutoff.map(|c| c.to_string()),
            timestamp: crate::envelope::now_ms(),
        }
    }
}

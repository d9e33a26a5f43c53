// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Envelope: the lifecycle record wrapping one in-flight message.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// 128-bit opaque message identifier.
///
/// Built the way GUIDs are built elsewhere in this lineage: a monotonic
/// sequence-derived prefix for debuggability plus a random suffix so ids
/// never collide without cross-thread coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Generate a new id from a sequence number (high 8 bytes) and process
    /// randomness (low 8 bytes).
    #[must_use]
    pub fn generate(sequence: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&sequence.to_be_bytes());
        bytes[8..].copy_from_slice(&fastrand::u64(..).to_be_bytes());
        MessageId(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Current wall-clock time, in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of an envelope (distilled spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ready,
    InFlight,
    Completed,
    DeadLetter,
    Superseded,
    Empty,
}

/// Exclusive, time-bounded ownership of an `InFlight` envelope by a handler instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub handler_id: String,
    pub checkout_ts: TimestampMs,
    pub expiry_ts: TimestampMs,
    pub extension_count: u32,
}

impl Lease {
    #[must_use]
    pub fn new(handler_id: impl Into<String>, duration_ms: u64) -> Self {
        let checkout_ts = now_ms();
        Self {
            handler_id: handler_id.into(),
            checkout_ts,
            expiry_ts: checkout_ts.saturating_add(duration_ms),
            extension_count: 0,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        self.expiry_ts < now
    }
}

/// Caller-supplied metadata traveling with an envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub source: Option<String>,
    pub version: u32,
}

/// The lifecycle record for one message (distilled spec §3).
///
/// Envelopes are treated as immutable once published into a slot; every
/// lifecycle transition constructs a fresh value and swaps it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
    pub status: Status,
    pub retry_count: u32,
    pub max_retries: u32,
    pub lease: Option<Lease>,
    pub enqueued_at: TimestampMs,
    pub not_before: Option<TimestampMs>,
    pub metadata: EnvelopeMetadata,
    pub last_persisted_version: u64,
    pub superseded: bool,
}

impl Envelope {
    /// Construct a fresh `Ready` envelope.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        dedup_key: Option<String>,
        max_retries: u32,
        metadata: EnvelopeMetadata,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload,
            dedup_key,
            status: Status::Ready,
            retry_count: 0,
            max_retries,
            lease: None,
            enqueued_at: now_ms(),
            not_before: None,
            metadata,
            last_persisted_version: 0,
            superseded: false,
        }
    }

    /// Whether this envelope is eligible for checkout right now.
    #[must_use]
    pub fn is_eligible(&self, type_tag: &str, now: TimestampMs) -> bool {
        self.status == Status::Ready
            && !self.superseded
            && self.message_type == type_tag
            && self.not_before.map_or(true, |nb| nb <= now)
    }

    /// Produce a new snapshot transitioned into `InFlight` under the given lease.
    #[must_use]
    pub fn checked_out(&self, lease: Lease, sequence: u64) -> Self {
        let mut next = self.clone();
        next.status = Status::InFlight;
        next.lease = Some(lease);
        next.last_persisted_version = sequence;
        next
    }

    /// Produce a new snapshot transitioned back to `Ready` with incremented retry count.
    #[must_use]
    pub fn requeued(&self, not_before: TimestampMs, sequence: u64) -> Self {
        let mut next = self.clone();
        next.status = Status::Ready;
        next.lease = None;
        next.retry_count = next.retry_count.saturating_add(1);
        next.not_before = Some(not_before);
        next.last_persisted_version = sequence;
        next.superseded = false;
        next
    }

    /// Produce a new snapshot marked `Superseded` (predecessor of a dedup replacement),
    /// retaining its lease and ids per distilled spec §4.1 `replace`.
    #[must_use]
    pub fn superseded(&self, sequence: u64) -> Self {
        let mut next = self.clone();
        next.status = Status::Superseded;
        next.superseded = true;
        next.last_persisted_version = sequence;
        next
    }

    /// Produce a new snapshot marked `Completed`.
    #[must_use]
    pub fn completed(&self, sequence: u64) -> Self {
        let mut next = self.clone();
        next.status = Status::Completed;
        next.lease = None;
        next.last_persisted_version = sequence;
        next
    }
}

/// Failure metadata recorded when an envelope is routed to the dead-letter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failure_reason: String,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub stack_trace: Option<String>,
    pub failure_timestamp: TimestampMs,
    pub last_handler_id: Option<String>,
}

/// `Envelope` extended with failure metadata (distilled spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub envelope: Envelope,
    pub failure: FailureInfo,
}

impl DeadLetterEnvelope {
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.envelope.message_id
    }
}

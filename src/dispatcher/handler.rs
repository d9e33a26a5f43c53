// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Handler trait and supporting context (distilled spec §4.4, §6).

use crate::envelope::{Envelope, MessageId};

/// Failure detail a handler can attach to a failed attempt. Carried through
/// to the retry/dead-letter path as [`crate::envelope::FailureInfo`].
#[derive(Debug, Clone, Default)]
pub struct HandlerError {
    pub reason: String,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl HandlerError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for HandlerError {}

/// Outcome of one handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Per-invocation context passed to a handler: identifies the message being
/// processed and lets the handler report progress without reaching back
/// into the queue manager directly.
pub struct HandlerContext<'a> {
    message_id: MessageId,
    report_progress: &'a dyn Fn(u8, Option<String>),
}

impl<'a> HandlerContext<'a> {
    #[must_use]
    pub fn new(message_id: MessageId, report_progress: &'a dyn Fn(u8, Option<String>)) -> Self {
        Self {
            message_id,
            report_progress,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Report progress, 0..=100, with an optional human-readable status.
    pub fn heartbeat(&self, progress_pct: u8, message: Option<String>) {
        (self.report_progress)(progress_pct, message);
    }
}

/// User-supplied processing logic for one message type.
///
/// Implementors must be safe to invoke concurrently from multiple worker
/// threads unless `max_parallelism` is 1 for that type.
pub trait Handler: Send + Sync {
    fn handle(&self, envelope: &Envelope, ctx: &HandlerContext<'_>) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Envelope, &HandlerContext<'_>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, envelope: &Envelope, ctx: &HandlerContext<'_>) -> HandlerResult {
        self(envelope, ctx)
    }
}

/// Produces one handler instance per worker thread, so stateful handlers
/// don't need to be internally synchronized across workers.
pub type HandlerFactory = dyn Fn() -> Box<dyn Handler> + Send + Sync;

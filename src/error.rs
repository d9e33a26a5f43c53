// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the queue engine.

use std::fmt;

/// Result type for all fallible queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the queue engine.
///
/// Recoverable variants (`QueueFull`, `InvalidArgument`, `HandlerNotRegistered`) are meant
/// to be handled at the call site. `PersistenceIo` and `CorruptRecord` are recovered
/// internally by the engine and only surfaced for telemetry. `HandlerTimeout` and
/// `HandlerFailure` feed the retry/dead-letter pipeline and rarely escape to callers.
#[derive(Debug)]
pub enum Error {
    /// The slot array has no empty cell on a full scan pass.
    QueueFull,
    /// `checkout`/`register_handler` referenced a type tag with no registered handler.
    HandlerNotRegistered(String),
    /// `start()` called while the dispatcher is already running.
    AlreadyRunning,
    /// An operation that requires a running dispatcher was called while stopped.
    NotRunning,
    /// A caller-supplied argument failed validation.
    InvalidArgument(String),
    /// `extend_lease`/`heartbeat` referenced a message whose lease already expired or was requeued.
    LeaseLost,
    /// A journal or snapshot write failed. The in-memory effect is retained; the
    /// next snapshot reconciles durable state.
    PersistenceIo(String),
    /// A journal record failed CRC validation during replay.
    CorruptRecord { sequence: u64, reason: String },
    /// The dead-letter store is at capacity; the message was dropped rather than wedging the queue.
    DeadLetterFull,
    /// A handler did not return before its deadline.
    HandlerTimeout,
    /// A handler returned an application-level failure.
    HandlerFailure(String),
    /// Wraps a lower-level I/O failure opening journal/snapshot files at startup.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueFull => write!(f, "queue is at capacity"),
            Error::HandlerNotRegistered(t) => write!(f, "no handler registered for type {t:?}"),
            Error::AlreadyRunning => write!(f, "dispatcher is already running"),
            Error::NotRunning => write!(f, "dispatcher is not running"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::LeaseLost => write!(f, "lease was lost or already released"),
            Error::PersistenceIo(msg) => write!(f, "persistence I/O error: {msg}"),
            Error::CorruptRecord { sequence, reason } => {
                write!(f, "corrupt journal record at sequence {sequence}: {reason}")
            }
            Error::DeadLetterFull => write!(f, "dead-letter store is at capacity"),
            Error::HandlerTimeout => write!(f, "handler exceeded its deadline"),
            Error::HandlerFailure(msg) => write!(f, "handler failed: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

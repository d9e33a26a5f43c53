// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An embeddable, persistent, at-least-once message queue.
//!
//! ```text
//!                    +------------------+
//!   enqueue() ------>|   QueueManager   |<------ admin::AdminApi
//!                    |  SlotArray       |
//!                    |  DedupIndex      |
//!                    |  DeadLetterStore |
//!                    |  Persister       |
//!                    +--------+---------+
//!                             |
//!                      wake::WakeNotifier
//!                             |
//!                    +--------v---------+
//!                    |    Dispatcher    |
//!                    |  WorkerPool x N  |-----> your Handler impls
//!                    +------------------+
//! ```
//!
//! The queue lives entirely in one process: a fixed-capacity lock-free
//! [`slots::SlotArray`] holds every in-flight [`envelope::Envelope`], a
//! write-ahead journal plus periodic snapshots give it crash durability,
//! and a thread-per-type [`dispatcher::WorkerPool`] drives registered
//! [`dispatcher::Handler`] implementations against checked-out messages
//! with lease-based exclusive ownership, retry backoff, and dead-lettering.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use embermq::config::{HandlerOptions, QueueConfig};
//! use embermq::dispatcher::{Dispatcher, Handler, HandlerContext, HandlerResult};
//! use embermq::envelope::{Envelope, EnvelopeMetadata};
//! use embermq::manager::QueueManager;
//!
//! struct Printer;
//! impl Handler for Printer {
//!     fn handle(&self, envelope: &Envelope, _ctx: &HandlerContext<'_>) -> HandlerResult {
//!         println!("{}: {} bytes", envelope.message_id, envelope.payload.len());
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> embermq::error::Result<()> {
//! let config = QueueConfig::builder()
//!     .capacity(1_000)
//!     .enable_persistence(false)
//!     .build()?;
//! let manager = QueueManager::new(config)?;
//! let dispatcher = Arc::new(Dispatcher::new(manager.clone()));
//! dispatcher.register_handler("email.send", Arc::new(|| Box::new(Printer) as Box<dyn Handler>), HandlerOptions::default())?;
//! dispatcher.start()?;
//!
//! manager.enqueue("email.send", b"hello".to_vec(), None, None, EnvelopeMetadata::default())?;
//!
//! std::thread::sleep(Duration::from_millis(100));
//! dispatcher.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod persistence;
pub mod slots;
pub mod wake;

pub use admin::AdminApi;
pub use config::{HandlerOptions, QueueConfig, QueueConfigBuilder};
pub use dispatcher::{Dispatcher, Handler, HandlerContext, HandlerError, HandlerResult};
pub use envelope::{DeadLetterEnvelope, Envelope, MessageId, Status};
pub use error::{Error, Result};
pub use manager::QueueManager;

/// Crate version, as published to crates.io.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

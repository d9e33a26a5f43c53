// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-process administrative surface: metrics, scaling, snapshot triggers,
//! and dead-letter management (distilled spec §4.5, §6). Deliberately has
//! no network listener -- wiring this to RPC or HTTP is left to the
//! embedding application, the same boundary this crate lineage draws
//! between its admin snapshot builders and the transport that serves them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::envelope::{DeadLetterEnvelope, MessageId, TimestampMs};
use crate::error::Result;
use crate::metrics::{EngineMetricsSnapshot, HandlerMetricsSnapshot};
use crate::persistence::RecoveryStats;

/// Point-in-time view of the whole queue, suitable for a status endpoint or
/// a periodic telemetry export.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub engine: EngineMetricsSnapshot,
    pub handlers: HashMap<String, HandlerMetricsSnapshot>,
    pub dead_letter_count: usize,
    pub live_message_count: usize,
}

/// Administrative facade over a running [`Dispatcher`].
pub struct AdminApi {
    dispatcher: Arc<Dispatcher>,
}

impl AdminApi {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.dispatcher.queue_manager().metrics()
    }

    #[must_use]
    pub fn handler_metrics(&self) -> HashMap<String, HandlerMetricsSnapshot> {
        self.dispatcher.handler_metrics()
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let manager = self.dispatcher.queue_manager();
        QueueSnapshot {
            engine: manager.metrics(),
            handlers: self.dispatcher.handler_metrics(),
            dead_letter_count: manager.dead_letters().len(),
            live_message_count: manager.get_count(),
        }
    }

    #[must_use]
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.dispatcher.queue_manager().recovery_stats()
    }

    /// Resize the worker pool for `message_type`, clamped to that type's
    /// registered parallelism bounds.
    pub fn scale(&self, message_type: &str, target_parallelism: usize) -> Result<()> {
        self.dispatcher.scale(message_type, target_parallelism)
    }

    /// Force an out-of-cycle snapshot write.
    pub fn trigger_snapshot(&self) -> Result<()> {
        self.dispatcher.queue_manager().snapshot_now()
    }

    #[must_use]
    pub fn list_dead_letters(&self) -> Vec<DeadLetterEnvelope> {
        self.dispatcher.queue_manager().dead_letters().list_all()
    }

    pub fn replay_dead_letter(&self, id: MessageId) -> Result<()> {
        self.dispatcher.queue_manager().replay_dead_letter(id)
    }

    pub fn purge_dead_letters(&self, older_than: Option<TimestampMs>) -> usize {
        self.dispatcher.queue_manager().purge_dead_letters(older_than)
    }
}

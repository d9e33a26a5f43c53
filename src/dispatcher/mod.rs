// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dispatcher: owns one [`pool::WorkerPool`] per registered message type
//! (distilled spec §4.4).

pub mod handler;
pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::HandlerOptions;
use crate::error::{Error, Result};
use crate::manager::QueueManager;
use crate::metrics::HandlerMetricsSnapshot;

pub use handler::{Handler, HandlerContext, HandlerError, HandlerFactory, HandlerResult};
pub use pool::WorkerPool;

/// Fans checked-out work for each registered message type out to its own
/// worker pool, and starts/stops every pool together.
pub struct Dispatcher {
    manager: QueueManager,
    pools: Mutex<HashMap<String, Arc<WorkerPool>>>,
    running: AtomicBool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            pools: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a handler factory for `message_type`. Must be called before
    /// [`Dispatcher::start`]; registering the same type twice replaces the
    /// previous registration.
    pub fn register_handler(
        &self,
        message_type: impl Into<String>,
        factory: Arc<HandlerFactory>,
        options: HandlerOptions,
    ) -> Result<()> {
        crate::config::validate_handler_options(&options)?;
        if self.running.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(
                "cannot register a handler while the dispatcher is running".into(),
            ));
        }
        let message_type = message_type.into();
        let pool = Arc::new(WorkerPool::new(
            message_type.clone(),
            self.manager.clone(),
            factory,
            options,
        ));
        self.pools.lock().unwrap().insert(message_type, pool);
        Ok(())
    }

    /// Start the queue manager's lease monitor and every registered pool.
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        self.manager.start()?;
        for pool in self.pools.lock().unwrap().values() {
            pool.start();
        }
        Ok(())
    }

    /// Stop every pool and the queue manager's lease monitor.
    pub fn stop(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::NotRunning);
        }
        for pool in self.pools.lock().unwrap().values() {
            pool.stop();
        }
        self.manager.stop()?;
        Ok(())
    }

    /// Resize the worker pool for `message_type`, clamped to that type's
    /// registered `[min_parallelism, max_parallelism]`.
    pub fn scale(&self, message_type: &str, target: usize) -> Result<()> {
        let pools = self.pools.lock().unwrap();
        let pool = pools
            .get(message_type)
            .ok_or_else(|| Error::HandlerNotRegistered(message_type.to_string()))?;
        pool.scale(target);
        Ok(())
    }

    /// Per-handler-type processing metrics.
    #[must_use]
    pub fn handler_metrics(&self) -> HashMap<String, HandlerMetricsSnapshot> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.metrics()))
            .collect()
    }

    #[must_use]
    pub fn queue_manager(&self) -> &QueueManager {
        &self.manager
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queue configuration - single source of truth for capacity, persistence, and
//! per-handler defaults.
//!
//! Mirrors the split used elsewhere in this crate: static defaults as plain
//! constants, and a runtime `QueueConfig` assembled through a builder and
//! validated once at construction time.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Minimum allowed main-store capacity (distilled spec §6).
pub const MIN_CAPACITY: usize = 100;
/// Maximum allowed main-store capacity.
pub const MAX_CAPACITY: usize = 1_000_000;
/// Minimum allowed dead-letter capacity.
pub const MIN_DEAD_LETTER_CAPACITY: usize = 100;
/// Maximum allowed dead-letter capacity.
pub const MAX_DEAD_LETTER_CAPACITY: usize = 100_000;

/// Default lease-monitor tick interval.
pub const DEFAULT_LEASE_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
/// Default handler invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default maximum retry count before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default initial retry backoff.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Default maximum retry backoff (ceiling for exponential growth).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Default lease duration granted on checkout.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
/// Safety margin subtracted from `lease_expiry` when computing a handler deadline,
/// so the dispatcher cancels a handler before the lease monitor could reclaim it.
pub const DEFAULT_DEADLINE_SAFETY_MARGIN: Duration = Duration::from_millis(250);

/// Backoff growth strategy applied to a requeued message's `not_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `initial * (retry_count + 1)`, clamped to `max_backoff`.
    Linear,
    /// `initial * 2^retry_count`, clamped to `max_backoff`.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

impl BackoffStrategy {
    /// Compute the backoff delay for the given (pre-increment) retry count.
    #[must_use]
    pub fn delay(self, retry_count: u32, initial: Duration, max: Duration) -> Duration {
        let computed = match self {
            BackoffStrategy::Linear => initial.saturating_mul(retry_count.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let shift = retry_count.min(32);
                initial.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
            }
        };
        computed.min(max)
    }
}

/// Per-handler registration options (distilled spec §6).
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub timeout: Duration,
    pub lease_duration: Duration,
    pub max_retries: u32,
    pub lease_extension_enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            min_parallelism: 1,
            max_parallelism: 4,
            timeout: DEFAULT_TIMEOUT,
            lease_duration: DEFAULT_LEASE_DURATION,
            max_retries: DEFAULT_MAX_RETRIES,
            lease_extension_enabled: true,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_strategy: BackoffStrategy::default(),
        }
    }
}

impl HandlerOptions {
    fn validate(&self) -> Result<()> {
        if self.min_parallelism == 0 {
            return Err(Error::InvalidArgument(
                "min_parallelism must be >= 1".into(),
            ));
        }
        if self.max_parallelism < self.min_parallelism {
            return Err(Error::InvalidArgument(
                "max_parallelism must be >= min_parallelism".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level queue configuration, assembled through [`QueueConfigBuilder`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub dead_letter_capacity: usize,
    pub persistence_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub snapshot_threshold: u64,
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub default_initial_backoff: Duration,
    pub default_max_backoff: Duration,
    pub default_backoff_strategy: BackoffStrategy,
    pub lease_monitor_interval: Duration,
    pub enable_persistence: bool,
    pub enable_deduplication: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            dead_letter_capacity: 1_000,
            persistence_path: None,
            snapshot_interval: Duration::from_secs(300),
            snapshot_threshold: 10_000,
            default_timeout: DEFAULT_TIMEOUT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_initial_backoff: DEFAULT_INITIAL_BACKOFF,
            default_max_backoff: DEFAULT_MAX_BACKOFF,
            default_backoff_strategy: BackoffStrategy::default(),
            lease_monitor_interval: DEFAULT_LEASE_MONITOR_INTERVAL,
            enable_persistence: true,
            enable_deduplication: true,
        }
    }
}

impl QueueConfig {
    /// Start building a configuration from defaults.
    #[must_use]
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.capacity) {
            return Err(Error::InvalidArgument(format!(
                "capacity must be in {MIN_CAPACITY}..={MAX_CAPACITY}, got {}",
                self.capacity
            )));
        }
        if !(MIN_DEAD_LETTER_CAPACITY..=MAX_DEAD_LETTER_CAPACITY)
            .contains(&self.dead_letter_capacity)
        {
            return Err(Error::InvalidArgument(format!(
                "dead_letter_capacity must be in {MIN_DEAD_LETTER_CAPACITY}..={MAX_DEAD_LETTER_CAPACITY}, got {}",
                self.dead_letter_capacity
            )));
        }
        if self.enable_persistence && self.persistence_path.is_none() {
            return Err(Error::InvalidArgument(
                "persistence_path is required when enable_persistence is set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    inner: QueueConfig,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = value;
            self
        }
    };
}

impl QueueConfigBuilder {
    setter!(capacity, usize);
    setter!(dead_letter_capacity, usize);
    setter!(snapshot_interval, Duration);
    setter!(snapshot_threshold, u64);
    setter!(default_timeout, Duration);
    setter!(default_max_retries, u32);
    setter!(default_initial_backoff, Duration);
    setter!(default_max_backoff, Duration);
    setter!(default_backoff_strategy, BackoffStrategy);
    setter!(lease_monitor_interval, Duration);
    setter!(enable_persistence, bool);
    setter!(enable_deduplication, bool);

    #[must_use]
    pub fn persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.persistence_path = Some(path.into());
        self
    }

    /// Validate and produce the final configuration.
    pub fn build(self) -> Result<QueueConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

pub(crate) fn validate_handler_options(opts: &HandlerOptions) -> Result<()> {
    opts.validate()
}

//! Work queue configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, env_millis, env_parse};
use crate::error::{Error, Result};
use crate::persistence::MAX_PRIORITY;

/// Work queue configuration
///
/// # Example
///
/// ```
/// use lockstep::JobQueueConfig;
/// use std::time::Duration;
///
/// let config = JobQueueConfig::new("mail")
///     .with_buffer_size(50)
///     .with_extra_lease(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobQueueConfig {
    /// Logical queue name, the store namespace
    pub name: String,

    /// Priority given to items enqueued without one (0 is most urgent)
    pub default_priority: u32,

    /// Items per label buffered before a flush
    pub buffer_size: usize,

    /// Lease granted on claim; also bounds the saturation wait
    #[serde(with = "duration_millis")]
    pub extra_lease: Duration,

    /// Age at which a label buffer is flushed regardless of its size
    #[serde(with = "duration_millis")]
    pub buffer_lifetime: Duration,

    /// Unit of the Fibonacci saturation backoff
    #[serde(with = "duration_millis")]
    pub backoff_unit: Duration,

    /// A label is saturated once it holds `buffer_size * backlog_factor` items
    pub backlog_factor: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_priority: 5,
            buffer_size: 100,
            extra_lease: Duration::from_secs(60),
            buffer_lifetime: Duration::from_secs(1),
            backoff_unit: Duration::from_secs(1),
            backlog_factor: 10,
        }
    }
}

impl JobQueueConfig {
    /// Create a configuration for the named queue with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Reads `LOCKSTEP_QUEUE_NAME`, `LOCKSTEP_QUEUE_PRIORITY`,
    /// `LOCKSTEP_QUEUE_BUFFER_SIZE`, `LOCKSTEP_QUEUE_EXTRA_LEASE_MS`,
    /// `LOCKSTEP_QUEUE_BUFFER_LIFETIME_MS`, `LOCKSTEP_QUEUE_BACKOFF_UNIT_MS` and
    /// `LOCKSTEP_QUEUE_BACKLOG_FACTOR`; unset or malformed values keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: std::env::var("LOCKSTEP_QUEUE_NAME").unwrap_or(defaults.name),
            default_priority: env_parse("LOCKSTEP_QUEUE_PRIORITY")
                .unwrap_or(defaults.default_priority),
            buffer_size: env_parse("LOCKSTEP_QUEUE_BUFFER_SIZE").unwrap_or(defaults.buffer_size),
            extra_lease: env_millis("LOCKSTEP_QUEUE_EXTRA_LEASE_MS")
                .unwrap_or(defaults.extra_lease),
            buffer_lifetime: env_millis("LOCKSTEP_QUEUE_BUFFER_LIFETIME_MS")
                .unwrap_or(defaults.buffer_lifetime),
            backoff_unit: env_millis("LOCKSTEP_QUEUE_BACKOFF_UNIT_MS")
                .unwrap_or(defaults.backoff_unit),
            backlog_factor: env_parse("LOCKSTEP_QUEUE_BACKLOG_FACTOR")
                .unwrap_or(defaults.backlog_factor),
        }
    }

    /// Set the default priority
    pub fn with_default_priority(mut self, priority: u32) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set the per-label buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the lease granted on claim
    pub fn with_extra_lease(mut self, lease: Duration) -> Self {
        self.extra_lease = lease;
        self
    }

    /// Set the buffer lifetime
    pub fn with_buffer_lifetime(mut self, lifetime: Duration) -> Self {
        self.buffer_lifetime = lifetime;
        self
    }

    /// Set the saturation backoff unit
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Set the backlog factor
    pub fn with_backlog_factor(mut self, factor: usize) -> Self {
        self.backlog_factor = factor;
        self
    }

    /// Count at which a label is considered saturated
    pub fn saturation_threshold(&self) -> u64 {
        self.buffer_size.saturating_mul(self.backlog_factor) as u64
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("queue name must not be empty".into()));
        }
        if self.default_priority > MAX_PRIORITY {
            return Err(Error::Configuration(format!(
                "default_priority must be at most {MAX_PRIORITY}"
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::Configuration("buffer_size must be at least 1".into()));
        }
        if self.backlog_factor == 0 {
            return Err(Error::Configuration(
                "backlog_factor must be at least 1".into(),
            ));
        }
        if self.extra_lease.is_zero() {
            return Err(Error::Configuration("extra_lease must be positive".into()));
        }
        if self.backoff_unit.is_zero() {
            return Err(Error::Configuration("backoff_unit must be positive".into()));
        }
        Ok(())
    }
}

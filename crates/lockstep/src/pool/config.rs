//! Resource pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::allocation::RenewalWindows;
use crate::config::{duration_millis, env_millis, env_parse};
use crate::error::{Error, Result};

/// Resource pool configuration
///
/// `extra` is how long a membership stays valid without renewal inside this
/// process; `extra_rate` sizes the debounce window that sits before it and the
/// safety margin added to the deadline published in the store.
///
/// # Example
///
/// ```
/// use lockstep::ResourcePoolConfig;
/// use std::time::Duration;
///
/// let config = ResourcePoolConfig::new("smtp-relays")
///     .with_extra(Duration::from_secs(120))
///     .with_extra_rate(0.5);
/// let windows = config.windows();
/// assert_eq!(windows.lock, Duration::from_secs(60));
/// assert_eq!(windows.internal, Duration::from_secs(180));
/// assert_eq!(windows.external, Duration::from_secs(240));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePoolConfig {
    /// Logical pool name, the store namespace
    pub name: String,

    /// Identity of this coordinator among the pool's members
    pub pool_id: String,

    /// Membership validity inside this process
    #[serde(with = "duration_millis")]
    pub extra: Duration,

    /// Fraction of `extra` used for the debounce window, in `[0.1, 1.0]`
    pub extra_rate: f64,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            pool_id: format!("pool-{}", Uuid::now_v7()),
            extra: Duration::from_secs(180),
            extra_rate: 0.2,
        }
    }
}

impl ResourcePoolConfig {
    /// Create a configuration for the named pool with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Reads `LOCKSTEP_POOL_NAME`, `LOCKSTEP_POOL_ID`, `LOCKSTEP_POOL_EXTRA_MS`
    /// and `LOCKSTEP_POOL_EXTRA_RATE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: std::env::var("LOCKSTEP_POOL_NAME").unwrap_or(defaults.name),
            pool_id: std::env::var("LOCKSTEP_POOL_ID").unwrap_or(defaults.pool_id),
            extra: env_millis("LOCKSTEP_POOL_EXTRA_MS").unwrap_or(defaults.extra),
            extra_rate: env_parse("LOCKSTEP_POOL_EXTRA_RATE").unwrap_or(defaults.extra_rate),
        }
    }

    /// Set the pool id
    pub fn with_pool_id(mut self, id: impl Into<String>) -> Self {
        self.pool_id = id.into();
        self
    }

    /// Set the membership validity
    pub fn with_extra(mut self, extra: Duration) -> Self {
        self.extra = extra;
        self
    }

    /// Set the debounce rate
    pub fn with_extra_rate(mut self, rate: f64) -> Self {
        self.extra_rate = rate;
        self
    }

    /// Renewal windows derived from `extra` and `extra_rate`
    pub fn windows(&self) -> RenewalWindows {
        RenewalWindows::new(self.extra, self.extra_rate)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("pool name must not be empty".into()));
        }
        if self.pool_id.trim().is_empty() {
            return Err(Error::Configuration("pool_id must not be empty".into()));
        }
        if self.extra.is_zero() {
            return Err(Error::Configuration("extra must be positive".into()));
        }
        if !(0.1..=1.0).contains(&self.extra_rate) {
            return Err(Error::Configuration(format!(
                "extra_rate must be within 0.1-1.0, got {}",
                self.extra_rate
            )));
        }
        Ok(())
    }
}

//! Handle to a resource taken from a pool

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use super::allocation::LocalStatus;
use super::coordinator::PoolInner;
use crate::error::{Error, Result};
use crate::persistence::ResourceRecord;

/// A resource in use by the caller
///
/// The resource stays unavailable to other `get` calls on the same
/// coordinator until it is released. Dropping an unreleased handle frees it
/// without a block.
pub struct ResourceHandle {
    pool: Arc<PoolInner>,
    record: ResourceRecord,
    released: bool,
}

impl ResourceHandle {
    pub(crate) fn new(pool: Arc<PoolInner>, record: ResourceRecord) -> Self {
        Self {
            pool,
            record,
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// The resource value.
    ///
    /// Renews the pool membership first, so this fails with
    /// [`Error::ExpiredResource`] once ownership can no longer be vouched for.
    pub async fn value(&self) -> Result<&serde_json::Value> {
        if self.released {
            return Err(Error::AlreadyReleased);
        }
        self.pool.update().await?;
        Ok(&self.record.value)
    }

    /// Hand the resource back to the pool.
    ///
    /// With `block`, the resource is kept but not handed out again until the
    /// duration passes.
    pub async fn release(&mut self, block: Option<Duration>) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased);
        }
        let status = match block {
            Some(block) if !block.is_zero() => LocalStatus::BlockedUntil(Instant::now() + block),
            _ => LocalStatus::Free,
        };
        self.pool.set_status(self.record.id, status);
        self.released = true;
        self.pool.update().await
    }

    /// Report the resource as broken and hand it back unblocked
    pub async fn broken(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased);
        }
        warn!(
            pool = %self.pool.name(),
            resource_id = %self.record.id,
            value = %self.record.value,
            "resource reported broken"
        );
        self.release(None).await
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.record.id)
            .field("value", &self.record.value)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if !self.released {
            self.pool.set_status(self.record.id, LocalStatus::Free);
        }
    }
}

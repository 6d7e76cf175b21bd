//! CoordinationStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored data violates an invariant the adapter relies on
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// Largest priority a work item may carry; stores keep priorities as signed 32-bit
pub const MAX_PRIORITY: u32 = i32::MAX as u32;

/// Deadline stored on items nobody holds.
pub fn unlocked_sentinel() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Convert a lease duration into a chrono offset, saturating on overflow
pub(crate) fn lease_offset(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

/// A work item waiting to be inserted by a flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub label: String,
    pub value: serde_json::Value,
    /// Ascending priority, 0 is dispatched first
    pub priority: u32,
    /// Tag of the producer that enqueued the item
    pub owner_tag: String,
}

/// A persisted work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub label: String,
    pub value: serde_json::Value,
    pub priority: u32,
    pub owner_tag: String,
    /// Current claimant, `None` when the item is free
    pub lock_holder: Option<String>,
    /// Lease deadline; the item is claimable once this has passed
    pub lock_expires_at: DateTime<Utc>,
}

impl WorkItem {
    /// Whether a claim at `now` would pick this item up
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at <= now
    }

    /// Precondition used by every mutation after a claim
    pub fn fingerprint(&self) -> LeaseFingerprint {
        LeaseFingerprint {
            id: self.id,
            lock_holder: self.lock_holder.clone(),
            lock_expires_at: self.lock_expires_at,
        }
    }
}

/// Optimistic-concurrency precondition for release and delete.
///
/// A mutation matches only while the stored item still carries exactly the
/// holder and deadline observed at claim time. Once someone else re-claims an
/// expired item its deadline changes and stale mutations match nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseFingerprint {
    pub id: Uuid,
    pub lock_holder: Option<String>,
    pub lock_expires_at: DateTime<Utc>,
}

impl LeaseFingerprint {
    pub(crate) fn matches(&self, item: &WorkItem) -> bool {
        item.id == self.id
            && item.lock_holder == self.lock_holder
            && item.lock_expires_at == self.lock_expires_at
    }
}

/// Filter for counting work items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub label: Option<String>,
    pub owner_tag: Option<String>,
}

impl ItemFilter {
    /// Match every item of the queue
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_owner_tag(mut self, owner_tag: impl Into<String>) -> Self {
        self.owner_tag = Some(owner_tag.into());
        self
    }

    pub(crate) fn matches(&self, item: &WorkItem) -> bool {
        self.label.as_ref().map_or(true, |l| *l == item.label)
            && self.owner_tag.as_ref().map_or(true, |t| *t == item.owner_tag)
    }
}

/// Membership row of one live pool coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMembership {
    pub pool_id: String,
    pub created_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PoolMembership {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A shared resource and its current owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    /// Opaque caller-defined value, also the record's identity
    pub value: serde_json::Value,
    pub owner_pool_id: Option<String>,
}

/// Storage contract for work queues and resource pools.
///
/// Every operation is namespaced by a queue or pool name. Correctness of the
/// coordinators above relies on `claim_item` and `claim_resource` being atomic
/// find-and-modify operations and on `release_item`, `delete_item` and
/// `disown_resource` being conditional writes that report their match count.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    // =========================================================================
    // Work queue operations
    // =========================================================================

    /// Batch insert claimable items. Returns the number inserted.
    async fn insert_items(&self, queue: &str, items: Vec<NewWorkItem>)
        -> Result<usize, StoreError>;

    /// Count items matching the filter
    async fn count_items(&self, queue: &str, filter: &ItemFilter) -> Result<u64, StoreError>;

    /// Atomically claim the most urgent claimable item.
    ///
    /// Considers items whose label is in `labels` (any label when empty) and
    /// whose deadline has passed, ordered by `(priority, id)` ascending. The
    /// winner gets `lock_holder = claimant` and a deadline of `now + lease`.
    async fn claim_item(
        &self,
        queue: &str,
        claimant: &str,
        labels: &[String],
        lease: Duration,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Reset a claimed item to the unlocked sentinel. Returns the match count.
    async fn release_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError>;

    /// Delete a claimed item. Returns the match count.
    async fn delete_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError>;

    /// Remove every item of the queue
    async fn drop_queue(&self, queue: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Pool membership operations
    // =========================================================================

    /// Insert or reset a membership expiring `ttl` from now
    async fn upsert_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<PoolMembership, StoreError>;

    /// Push an existing membership's deadline to `ttl` from now. Returns the match count.
    async fn renew_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Remove one membership. Returns the match count.
    async fn remove_membership(&self, pool: &str, pool_id: &str) -> Result<u64, StoreError>;

    /// Remove memberships whose deadline has passed. Returns how many were removed.
    async fn remove_expired_memberships(&self, pool: &str) -> Result<u64, StoreError>;

    /// Memberships that have not expired, ordered by pool id
    async fn live_memberships(&self, pool: &str) -> Result<Vec<PoolMembership>, StoreError>;

    // =========================================================================
    // Resource operations
    // =========================================================================

    /// Insert a resource keyed by its value, or return the existing record
    async fn upsert_resource(
        &self,
        pool: &str,
        value: &serde_json::Value,
    ) -> Result<ResourceRecord, StoreError>;

    /// Count resources, optionally only those owned by `owner`
    async fn count_resources(&self, pool: &str, owner: Option<&str>) -> Result<u64, StoreError>;

    /// Atomically take ownership of one resource not held by a live member
    async fn claim_resource(
        &self,
        pool: &str,
        owner: &str,
        live_members: &[String],
    ) -> Result<Option<ResourceRecord>, StoreError>;

    /// Clear ownership of a resource still owned by `owner`. Returns the match count.
    async fn disown_resource(
        &self,
        pool: &str,
        resource_id: Uuid,
        owner: &str,
    ) -> Result<u64, StoreError>;

    /// Remove every membership and resource of the pool
    async fn drop_pool(&self, pool: &str) -> Result<(), StoreError>;
}

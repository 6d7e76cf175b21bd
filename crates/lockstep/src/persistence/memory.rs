//! In-memory implementation of CoordinationStore for testing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Memberships and resources of one pool
#[derive(Default)]
struct PoolState {
    members: BTreeMap<String, PoolMembership>,
    resources: BTreeMap<Uuid, ResourceRecord>,
}

/// In-memory implementation of CoordinationStore
///
/// Single-process only. Every operation takes the write lock of its namespace
/// map for its whole duration, which makes claims and conditional writes
/// atomic with the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use lockstep::InMemoryCoordinationStore;
///
/// let store = InMemoryCoordinationStore::new();
/// assert_eq!(store.item_count("default"), 0);
/// ```
pub struct InMemoryCoordinationStore {
    queues: RwLock<HashMap<String, BTreeMap<Uuid, WorkItem>>>,
    pools: RwLock<HashMap<String, PoolState>>,
}

impl InMemoryCoordinationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of items in a queue, claimed or not
    pub fn item_count(&self, queue: &str) -> usize {
        self.queues.read().get(queue).map_or(0, |items| items.len())
    }

    /// Snapshot of every item in a queue, ordered by id
    pub fn items(&self, queue: &str) -> Vec<WorkItem> {
        self.queues
            .read()
            .get(queue)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every resource in a pool, ordered by id
    pub fn resources(&self, pool: &str) -> Vec<ResourceRecord> {
        self.pools
            .read()
            .get(pool)
            .map(|state| state.resources.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make a membership look dead, as if its process stopped renewing it (for testing)
    pub fn expire_membership(&self, pool: &str, pool_id: &str) -> bool {
        let mut pools = self.pools.write();
        match pools
            .get_mut(pool)
            .and_then(|state| state.members.get_mut(pool_id))
        {
            Some(member) => {
                member.expires_at = unlocked_sentinel();
                true
            }
            None => false,
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.queues.write().clear();
        self.pools.write().clear();
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    // =========================================================================
    // Work queue operations
    // =========================================================================

    async fn insert_items(
        &self,
        queue: &str,
        items: Vec<NewWorkItem>,
    ) -> Result<usize, StoreError> {
        if let Some(item) = items.iter().find(|item| item.priority > MAX_PRIORITY) {
            return Err(StoreError::Integrity(format!(
                "priority {} of label '{}' exceeds {}",
                item.priority, item.label, MAX_PRIORITY
            )));
        }

        let now = Utc::now();
        let mut queues = self.queues.write();
        let stored = queues.entry(queue.to_string()).or_default();

        let count = items.len();
        for item in items {
            let id = Uuid::now_v7();
            stored.insert(
                id,
                WorkItem {
                    id,
                    label: item.label,
                    value: item.value,
                    priority: item.priority,
                    owner_tag: item.owner_tag,
                    lock_holder: None,
                    lock_expires_at: now,
                },
            );
        }

        Ok(count)
    }

    async fn count_items(&self, queue: &str, filter: &ItemFilter) -> Result<u64, StoreError> {
        let queues = self.queues.read();
        let count = queues
            .get(queue)
            .map_or(0, |items| items.values().filter(|i| filter.matches(i)).count());
        Ok(count as u64)
    }

    async fn claim_item(
        &self,
        queue: &str,
        claimant: &str,
        labels: &[String],
        lease: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        let now = Utc::now();
        let mut queues = self.queues.write();
        let Some(items) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let winner = items
            .values()
            .filter(|item| item.is_claimable_at(now))
            .filter(|item| labels.is_empty() || labels.contains(&item.label))
            .min_by_key(|item| (item.priority, item.id))
            .map(|item| item.id);

        let Some(id) = winner else {
            return Ok(None);
        };

        let item = items
            .get_mut(&id)
            .ok_or_else(|| StoreError::Integrity(format!("item {id} vanished during claim")))?;
        item.lock_holder = Some(claimant.to_string());
        item.lock_expires_at = now + lease_offset(lease);

        Ok(Some(item.clone()))
    }

    async fn release_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError> {
        let mut queues = self.queues.write();
        let Some(item) = queues
            .get_mut(queue)
            .and_then(|items| items.get_mut(&fingerprint.id))
        else {
            return Ok(0);
        };

        if !fingerprint.matches(item) {
            return Ok(0);
        }

        item.lock_holder = None;
        item.lock_expires_at = unlocked_sentinel();
        Ok(1)
    }

    async fn delete_item(
        &self,
        queue: &str,
        fingerprint: &LeaseFingerprint,
    ) -> Result<u64, StoreError> {
        let mut queues = self.queues.write();
        let Some(items) = queues.get_mut(queue) else {
            return Ok(0);
        };

        match items.get(&fingerprint.id) {
            Some(item) if fingerprint.matches(item) => {
                items.remove(&fingerprint.id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn drop_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.write().remove(queue);
        Ok(())
    }

    // =========================================================================
    // Pool membership operations
    // =========================================================================

    async fn upsert_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<PoolMembership, StoreError> {
        let now = Utc::now();
        let membership = PoolMembership {
            pool_id: pool_id.to_string(),
            created_at: now,
            last_renewed_at: now,
            expires_at: now + lease_offset(ttl),
        };

        let mut pools = self.pools.write();
        pools
            .entry(pool.to_string())
            .or_default()
            .members
            .insert(pool_id.to_string(), membership.clone());

        Ok(membership)
    }

    async fn renew_membership(
        &self,
        pool: &str,
        pool_id: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut pools = self.pools.write();
        match pools
            .get_mut(pool)
            .and_then(|state| state.members.get_mut(pool_id))
        {
            Some(member) => {
                member.last_renewed_at = now;
                member.expires_at = now + lease_offset(ttl);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove_membership(&self, pool: &str, pool_id: &str) -> Result<u64, StoreError> {
        let mut pools = self.pools.write();
        let removed = pools
            .get_mut(pool)
            .and_then(|state| state.members.remove(pool_id));
        Ok(u64::from(removed.is_some()))
    }

    async fn remove_expired_memberships(&self, pool: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut pools = self.pools.write();
        let Some(state) = pools.get_mut(pool) else {
            return Ok(0);
        };

        let before = state.members.len();
        state.members.retain(|_, member| member.is_live_at(now));
        Ok((before - state.members.len()) as u64)
    }

    async fn live_memberships(&self, pool: &str) -> Result<Vec<PoolMembership>, StoreError> {
        let now = Utc::now();
        let pools = self.pools.read();
        Ok(pools
            .get(pool)
            .map(|state| {
                state
                    .members
                    .values()
                    .filter(|member| member.is_live_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // =========================================================================
    // Resource operations
    // =========================================================================

    async fn upsert_resource(
        &self,
        pool: &str,
        value: &serde_json::Value,
    ) -> Result<ResourceRecord, StoreError> {
        let mut pools = self.pools.write();
        let state = pools.entry(pool.to_string()).or_default();

        if let Some(existing) = state.resources.values().find(|r| r.value == *value) {
            return Ok(existing.clone());
        }

        let record = ResourceRecord {
            id: Uuid::now_v7(),
            value: value.clone(),
            owner_pool_id: None,
        };
        state.resources.insert(record.id, record.clone());
        Ok(record)
    }

    async fn count_resources(&self, pool: &str, owner: Option<&str>) -> Result<u64, StoreError> {
        let pools = self.pools.read();
        let count = pools.get(pool).map_or(0, |state| {
            state
                .resources
                .values()
                .filter(|r| owner.map_or(true, |o| r.owner_pool_id.as_deref() == Some(o)))
                .count()
        });
        Ok(count as u64)
    }

    async fn claim_resource(
        &self,
        pool: &str,
        owner: &str,
        live_members: &[String],
    ) -> Result<Option<ResourceRecord>, StoreError> {
        let mut pools = self.pools.write();
        let Some(state) = pools.get_mut(pool) else {
            return Ok(None);
        };

        let candidate = state.resources.values_mut().find(|r| match &r.owner_pool_id {
            None => true,
            Some(current) => !live_members.contains(current),
        });

        Ok(candidate.map(|record| {
            record.owner_pool_id = Some(owner.to_string());
            record.clone()
        }))
    }

    async fn disown_resource(
        &self,
        pool: &str,
        resource_id: Uuid,
        owner: &str,
    ) -> Result<u64, StoreError> {
        let mut pools = self.pools.write();
        match pools
            .get_mut(pool)
            .and_then(|state| state.resources.get_mut(&resource_id))
        {
            Some(record) if record.owner_pool_id.as_deref() == Some(owner) => {
                record.owner_pool_id = None;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn drop_pool(&self, pool: &str) -> Result<(), StoreError> {
        self.pools.write().remove(pool);
        Ok(())
    }
}

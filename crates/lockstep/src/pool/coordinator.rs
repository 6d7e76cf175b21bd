//! Resource pool coordinator
//!
//! Each process joins a named pool with a membership lease and keeps a local
//! cache of the resources it owns. Renewal is debounced: within the lock
//! window after a renewal nothing touches the store. Past it, the next read
//! renews the membership and rebalances ownership so every live member holds
//! its share. Resources of members whose membership lapsed are reclaimed by
//! the survivors.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::allocation::{
    expected_quota, Allocation, ArbiterPolicy, LocalStatus, LowestMemberArbiter, PoolStatus,
    RenewalWindows,
};
use super::config::ResourcePoolConfig;
use super::handle::ResourceHandle;
use crate::error::{Error, Result};
use crate::persistence::{CoordinationStore, ResourceRecord};

/// Local state guarded by one short-lived mutex
struct PoolState {
    allocations: Vec<Allocation>,
    /// Renewals are skipped until this passes; `None` forces the next one
    lock_deadline: Option<Instant>,
    /// Past this the membership is considered lost
    internal_deadline: Instant,
    checked_out: bool,
}

/// Shared between the coordinator and its handles
pub(crate) struct PoolInner {
    store: Arc<dyn CoordinationStore>,
    config: ResourcePoolConfig,
    windows: RenewalWindows,
    arbiter: Arc<dyn ArbiterPolicy>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    fn pool_id(&self) -> &str {
        &self.config.pool_id
    }

    /// Renew the membership and rebalance, unless still inside the lock window.
    ///
    /// Deadlines only move once the store accepted the renewal; a failed
    /// renewal or rebalance leaves the lock window open so the next call retries.
    pub(crate) async fn update(&self) -> Result<()> {
        let now = Instant::now();
        {
            let state = self.state.lock();
            if state.checked_out {
                return Err(Error::ExpiredResource);
            }
            if state.lock_deadline.is_some_and(|deadline| now <= deadline) {
                return Ok(());
            }
            if now > state.internal_deadline {
                warn!(pool = %self.name(), pool_id = %self.pool_id(), "membership expired before renewal");
                return Err(Error::ExpiredResource);
            }
        }

        self.renew().await?;
        {
            let mut state = self.state.lock();
            state.internal_deadline = now + self.windows.internal;
            state.lock_deadline = Some(now + self.windows.lock);
        }

        if let Err(e) = self.allocate().await {
            self.state.lock().lock_deadline = None;
            return Err(e);
        }
        Ok(())
    }

    async fn renew(&self) -> Result<()> {
        let renewed = self
            .store
            .renew_membership(self.name(), self.pool_id(), self.windows.external)
            .await?;
        if renewed == 0 {
            warn!(pool = %self.name(), pool_id = %self.pool_id(), "membership vanished, re-registering");
            self.store
                .upsert_membership(self.name(), self.pool_id(), self.windows.external)
                .await?;
        }
        Ok(())
    }

    /// Bring this member's holdings to its expected quota
    #[instrument(skip(self), fields(pool = %self.config.name, pool_id = %self.config.pool_id))]
    async fn allocate(&self) -> Result<()> {
        let live: Vec<String> = self
            .store
            .live_memberships(self.name())
            .await?
            .into_iter()
            .map(|m| m.pool_id)
            .collect();
        let total = self.store.count_resources(self.name(), None).await?;
        let held = self
            .store
            .count_resources(self.name(), Some(self.pool_id()))
            .await?;
        let is_arbiter = self.arbiter.is_arbiter(self.pool_id(), &live);
        let expected = expected_quota(total, live.len(), is_arbiter);

        debug!(total, live = live.len(), held, expected, is_arbiter, "allocating");

        if held > expected {
            self.release_excess(held - expected).await
        } else if held < expected {
            self.claim_missing(expected - held, &live).await
        } else {
            Ok(())
        }
    }

    async fn release_excess(&self, excess: u64) -> Result<()> {
        let now = Instant::now();
        let surplus: Vec<ResourceRecord> = {
            let mut state = self.state.lock();
            let mut surplus = Vec::new();
            let mut i = 0;
            while i < state.allocations.len() && (surplus.len() as u64) < excess {
                if state.allocations[i].status.is_free_at(now) {
                    surplus.push(state.allocations.remove(i).record);
                } else {
                    i += 1;
                }
            }
            surplus
        };

        let released = surplus.len();
        self.disown_all(surplus).await?;

        if released > 0 {
            info!(
                pool = %self.name(),
                pool_id = %self.pool_id(),
                released,
                wanted = excess,
                "released surplus resources"
            );
        }
        Ok(())
    }

    /// Hand records back to the store one by one. On failure the record that
    /// failed and every record not yet attempted return to the local cache.
    async fn disown_all(&self, records: Vec<ResourceRecord>) -> Result<()> {
        let mut pending = records.into_iter();
        while let Some(record) = pending.next() {
            match self
                .store
                .disown_resource(self.name(), record.id, self.pool_id())
                .await
            {
                Ok(0) => warn!(resource_id = %record.id, "released resource was no longer ours"),
                Ok(_) => {}
                Err(e) => {
                    let kept: Vec<ResourceRecord> = std::iter::once(record).chain(pending).collect();
                    warn!(
                        pool = %self.name(),
                        pool_id = %self.pool_id(),
                        kept = kept.len(),
                        error = %e,
                        "disown failed, keeping resources"
                    );
                    self.adopt(kept);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Add records owned in the store to the local cache as free
    fn adopt(&self, records: Vec<ResourceRecord>) {
        let mut state = self.state.lock();
        state
            .allocations
            .extend(records.into_iter().map(|record| Allocation {
                record,
                status: LocalStatus::Free,
            }));
    }

    async fn claim_missing(&self, missing: u64, live: &[String]) -> Result<()> {
        let mut claimed = Vec::new();
        let mut outcome = Ok(());
        for _ in 0..missing {
            match self
                .store
                .claim_resource(self.name(), self.pool_id(), live)
                .await
            {
                Ok(Some(record)) => claimed.push(record),
                Ok(None) => break,
                Err(e) => {
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        if !claimed.is_empty() {
            info!(
                pool = %self.name(),
                pool_id = %self.pool_id(),
                claimed = claimed.len(),
                wanted = missing,
                "claimed resources"
            );
            self.adopt(claimed);
        }
        outcome
    }

    /// Change the local status of an allocation. No-op when it is gone.
    pub(crate) fn set_status(&self, resource_id: Uuid, status: LocalStatus) {
        let mut state = self.state.lock();
        if let Some(allocation) = state
            .allocations
            .iter_mut()
            .find(|a| a.record.id == resource_id)
        {
            allocation.status = status;
        }
    }

    async fn checkout(&self) -> Result<()> {
        let records: Vec<ResourceRecord> = {
            let mut state = self.state.lock();
            if state.checked_out {
                return Ok(());
            }
            state.checked_out = true;
            state.allocations.drain(..).map(|a| a.record).collect()
        };

        let released = records.len();
        let outcome = match self
            .store
            .remove_membership(self.name(), self.pool_id())
            .await
        {
            Ok(_) => self.disown_all(records).await,
            Err(e) => {
                self.adopt(records);
                Err(e.into())
            }
        };
        if let Err(e) = outcome {
            // Allow the checkout to be retried.
            self.state.lock().checked_out = false;
            return Err(e);
        }
        self.store.remove_expired_memberships(self.name()).await?;

        info!(
            pool = %self.name(),
            pool_id = %self.pool_id(),
            released,
            "checked out of resource pool"
        );
        Ok(())
    }
}

/// Member of a named resource pool
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lockstep::{InMemoryCoordinationStore, ResourcePool, ResourcePoolConfig};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> lockstep::Result<()> {
/// let store = Arc::new(InMemoryCoordinationStore::new());
/// let pool = ResourcePool::new(store, ResourcePoolConfig::new("relays")).await?;
/// pool.def(json!("smtp-1.example.com")).await?;
///
/// let mut relay = pool.get().await?.expect("one free relay");
/// assert_eq!(relay.value().await?, &json!("smtp-1.example.com"));
/// relay.release(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    /// Join the pool with the default arbiter policy
    pub async fn new(store: Arc<dyn CoordinationStore>, config: ResourcePoolConfig) -> Result<Self> {
        Self::with_arbiter(store, config, Arc::new(LowestMemberArbiter)).await
    }

    /// Join the pool with an explicit arbiter policy
    pub async fn with_arbiter(
        store: Arc<dyn CoordinationStore>,
        config: ResourcePoolConfig,
        arbiter: Arc<dyn ArbiterPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let windows = config.windows();
        let pool = Self {
            inner: Arc::new(PoolInner {
                store,
                windows,
                arbiter,
                state: Mutex::new(PoolState {
                    allocations: Vec::new(),
                    lock_deadline: None,
                    internal_deadline: Instant::now() + windows.internal,
                    checked_out: false,
                }),
                config,
            }),
        };
        pool.checkin().await?;
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn pool_id(&self) -> &str {
        self.inner.pool_id()
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.inner.config
    }

    pub fn windows(&self) -> RenewalWindows {
        self.inner.windows
    }

    /// Register this member and clean up members that stopped renewing
    #[instrument(skip(self), fields(pool = %self.name(), pool_id = %self.pool_id()))]
    async fn checkin(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .store
            .upsert_membership(inner.name(), inner.pool_id(), inner.windows.external)
            .await?;
        {
            let mut state = inner.state.lock();
            state.internal_deadline = Instant::now() + inner.windows.internal;
            state.lock_deadline = None;
        }
        info!("joined resource pool");
        self.clean().await
    }

    /// Renew, rebalance, and remove memberships whose deadline passed
    pub async fn clean(&self) -> Result<()> {
        self.inner.update().await?;
        let removed = self
            .inner
            .store
            .remove_expired_memberships(self.name())
            .await?;
        if removed > 0 {
            info!(pool = %self.name(), removed, "removed expired pool members");
        }
        Ok(())
    }

    /// Leave the pool, handing every owned resource back
    pub async fn checkout(&self) -> Result<()> {
        self.inner.checkout().await
    }

    /// Renew the membership and rebalance unless inside the lock window.
    ///
    /// Fails with [`Error::ExpiredResource`] once the membership went unrenewed
    /// past its internal deadline, or after checkout.
    pub async fn update(&self) -> Result<()> {
        self.inner.update().await
    }

    /// Force the next read to renew and rebalance
    pub fn reset_renewal_window(&self) {
        self.inner.state.lock().lock_deadline = None;
    }

    /// Define a resource, identified by its value
    pub async fn def(&self, value: serde_json::Value) -> Result<ResourceRecord> {
        if value.is_null() {
            return Err(Error::InvalidArgument("resource value must not be null".into()));
        }
        let record = self.inner.store.upsert_resource(self.name(), &value).await?;
        self.reset_renewal_window();
        debug!(pool = %self.name(), resource_id = %record.id, "defined resource");
        Ok(record)
    }

    /// Take one free resource, chosen at random
    pub async fn get(&self) -> Result<Option<ResourceHandle>> {
        self.inner.update().await?;

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let free: Vec<usize> = state
            .allocations
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status.is_free_at(now))
            .map(|(i, _)| i)
            .collect();
        if free.is_empty() {
            return Ok(None);
        }

        let pick = free[rand::thread_rng().gen_range(0..free.len())];
        let allocation = &mut state.allocations[pick];
        allocation.status = LocalStatus::InUse;
        Ok(Some(ResourceHandle::new(
            Arc::clone(&self.inner),
            allocation.record.clone(),
        )))
    }

    /// Take every free resource
    pub async fn get_all(&self) -> Result<Vec<ResourceHandle>> {
        self.inner.update().await?;

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        Ok(state
            .allocations
            .iter_mut()
            .filter(|a| a.status.is_free_at(now))
            .map(|allocation| {
                allocation.status = LocalStatus::InUse;
                ResourceHandle::new(Arc::clone(&self.inner), allocation.record.clone())
            })
            .collect())
    }

    /// Whether a `get` would return a resource right now
    pub async fn has_free(&self) -> Result<bool> {
        self.inner.update().await?;
        let now = Instant::now();
        Ok(self
            .inner
            .state
            .lock()
            .allocations
            .iter()
            .any(|a| a.status.is_free_at(now)))
    }

    /// Number of resources this member currently holds
    pub fn allocated_size(&self) -> usize {
        self.inner.state.lock().allocations.len()
    }

    /// Local snapshot of free, in-use and blocked resources
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus::collect(
            self.name(),
            self.pool_id(),
            &state.allocations,
            Instant::now(),
        )
    }

    /// Remove every membership and resource of this pool from the store
    pub async fn drop_pool(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.checked_out = true;
            state.allocations.clear();
        }
        self.inner.store.drop_pool(self.name()).await?;
        info!(pool = %self.name(), "dropped resource pool");
        Ok(())
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if self.inner.state.lock().checked_out {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(pool = %self.name(), "no runtime to check out, membership will expire");
            return;
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            if let Err(e) = inner.checkout().await {
                warn!(pool = %inner.name(), error = %e, "background checkout failed");
            }
        });
    }
}

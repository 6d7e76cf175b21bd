//! Lease handle over a claimed work item
//!
//! A [`Lease`] is the only way to act on a claimed item. Every mutation is a
//! conditional write predicated on the fingerprint captured at claim time, so
//! a worker whose lease elapsed and was re-claimed elsewhere can no longer
//! release or complete the item.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::{CoordinationStore, LeaseFingerprint, WorkItem};

/// Lifecycle of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Claimed and not yet terminated
    Active,
    /// Handed back for someone else to claim
    Released,
    /// Item deleted from the queue
    Completed,
    /// Deadline passed, or expired on request
    Expired,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LeaseState::Active)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Released => write!(f, "released"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Exclusive, time-bounded claim on one work item
pub struct Lease {
    store: Arc<dyn CoordinationStore>,
    queue: String,
    item: WorkItem,
    state: LeaseState,
}

impl Lease {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, queue: String, item: WorkItem) -> Self {
        Self {
            store,
            queue,
            item,
            state: LeaseState::Active,
        }
    }

    /// Item id
    pub fn id(&self) -> Uuid {
        self.item.id
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Lease deadline as granted by the store
    pub fn deadline(&self) -> DateTime<Utc> {
        self.item.lock_expires_at
    }

    pub fn fingerprint(&self) -> LeaseFingerprint {
        self.item.fingerprint()
    }

    /// Name of the queue the item was claimed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the lease has not been terminated yet. Does not look at the clock.
    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active
    }

    /// Item label. Fails with [`Error::ExpiredLease`] once the lease is over.
    pub async fn label(&mut self) -> Result<&str> {
        self.ensure_live().await?;
        Ok(&self.item.label)
    }

    /// Item value. Fails with [`Error::ExpiredLease`] once the lease is over.
    pub async fn value(&mut self) -> Result<&serde_json::Value> {
        self.ensure_live().await?;
        Ok(&self.item.value)
    }

    /// Item priority. Fails with [`Error::ExpiredLease`] once the lease is over.
    pub async fn priority(&mut self) -> Result<u32> {
        self.ensure_live().await?;
        Ok(self.item.priority)
    }

    /// Whether the lease is over.
    ///
    /// The first time the deadline is observed to have passed, the item is
    /// released so it becomes claimable again; later calls return the
    /// memoized answer.
    pub async fn is_expired(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(true);
        }
        if self.item.lock_expires_at > Utc::now() {
            return Ok(false);
        }

        debug!(queue = %self.queue, item_id = %self.item.id, "lease deadline passed");
        self.release_in_store().await?;
        self.state = LeaseState::Expired;
        Ok(true)
    }

    /// Hand the item back to the queue.
    ///
    /// A release that matches nothing means the lease was already lost; it is
    /// logged and treated as done. Releasing a lease that is no longer active
    /// fails with [`Error::AlreadyReleased`].
    pub async fn release(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::AlreadyReleased);
        }

        self.release_in_store().await?;
        self.state = LeaseState::Released;
        Ok(())
    }

    /// Delete the item from the queue.
    ///
    /// Fails with [`Error::ExpiredLease`] when the deadline has passed or the
    /// item was re-claimed by someone else in the meantime.
    pub async fn complete(&mut self) -> Result<()> {
        self.ensure_live().await?;

        let fingerprint = self.fingerprint();
        let matched = self.store.delete_item(&self.queue, &fingerprint).await?;
        match matched {
            1 => {
                debug!(queue = %self.queue, item_id = %self.item.id, "completed work item");
                self.state = LeaseState::Completed;
                Ok(())
            }
            0 => {
                warn!(
                    queue = %self.queue,
                    item_id = %self.item.id,
                    "complete matched nothing, lease was lost"
                );
                self.state = LeaseState::Expired;
                Err(Error::ExpiredLease)
            }
            n => Err(Error::Coordination(format!(
                "completing item {} deleted {} records",
                self.item.id, n
            ))),
        }
    }

    /// Give up the lease regardless of its deadline. No-op once terminal.
    pub async fn force_expire(&mut self) -> Result<()> {
        if self.is_expired().await? {
            return Ok(());
        }

        self.release_in_store().await?;
        self.state = LeaseState::Expired;
        Ok(())
    }

    async fn ensure_live(&mut self) -> Result<()> {
        if self.is_expired().await? {
            return Err(Error::ExpiredLease);
        }
        Ok(())
    }

    async fn release_in_store(&self) -> Result<()> {
        let fingerprint = self.fingerprint();
        let matched = self.store.release_item(&self.queue, &fingerprint).await?;
        match matched {
            0 => {
                warn!(
                    queue = %self.queue,
                    item_id = %self.item.id,
                    "stale release, item already re-claimed or removed"
                );
                Ok(())
            }
            1 => {
                debug!(queue = %self.queue, item_id = %self.item.id, "released work item");
                Ok(())
            }
            n => Err(Error::Coordination(format!(
                "releasing item {} updated {} records",
                self.item.id, n
            ))),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("queue", &self.queue)
            .field("id", &self.item.id)
            .field("label", &self.item.label)
            .field("deadline", &self.item.lock_expires_at)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }

        warn!(
            queue = %self.queue,
            item_id = %self.item.id,
            "lease dropped while active, releasing in background"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(item_id = %self.item.id, "no runtime to release dropped lease, it will expire");
            return;
        };

        let store = Arc::clone(&self.store);
        let queue = std::mem::take(&mut self.queue);
        let fingerprint = self.item.fingerprint();
        handle.spawn(async move {
            if let Err(e) = store.release_item(&queue, &fingerprint).await {
                warn!(queue = %queue, item_id = %fingerprint.id, error = %e, "background release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::persistence::{InMemoryCoordinationStore, NewWorkItem};

    async fn claimed(store: &Arc<InMemoryCoordinationStore>, lease: Duration) -> Lease {
        store
            .insert_items(
                "q",
                vec![NewWorkItem {
                    label: "mail".to_string(),
                    value: json!({"to": "a@example.com"}),
                    priority: 5,
                    owner_tag: "op".to_string(),
                }],
            )
            .await
            .unwrap();
        let item = store
            .claim_item("q", "worker-1", &[], lease)
            .await
            .unwrap()
            .unwrap();
        Lease::new(store.clone(), "q".to_string(), item)
    }

    #[tokio::test]
    async fn test_complete_deletes_item() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let mut lease = claimed(&store, Duration::from_secs(60)).await;

        assert_eq!(lease.label().await.unwrap(), "mail");
        assert_eq!(lease.value().await.unwrap()["to"], "a@example.com");
        lease.complete().await.unwrap();

        assert_eq!(lease.state(), LeaseState::Completed);
        assert_eq!(store.item_count("q"), 0);
    }

    #[tokio::test]
    async fn test_release_twice_fails() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let mut lease = claimed(&store, Duration::from_secs(60)).await;

        lease.release().await.unwrap();
        assert!(matches!(lease.release().await, Err(Error::AlreadyReleased)));
        assert!(matches!(lease.value().await, Err(Error::ExpiredLease)));

        // Released items are claimable again
        let again = store
            .claim_item("q", "worker-2", &[], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_release_after_complete_fails() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let mut lease = claimed(&store, Duration::from_secs(60)).await;

        lease.complete().await.unwrap();
        assert!(matches!(lease.release().await, Err(Error::AlreadyReleased)));
    }

    #[tokio::test]
    async fn test_expiry_releases_once() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let mut lease = claimed(&store, Duration::from_millis(20)).await;

        assert!(!lease.is_expired().await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lease.is_expired().await.unwrap());
        assert_eq!(lease.state(), LeaseState::Expired);
        assert!(lease.is_expired().await.unwrap());

        let stored = &store.items("q")[0];
        assert_eq!(stored.lock_holder, None);
        assert!(matches!(lease.complete().await, Err(Error::ExpiredLease)));
    }

    #[tokio::test]
    async fn test_force_expire_is_idempotent() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let mut lease = claimed(&store, Duration::from_secs(60)).await;

        lease.force_expire().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Expired);
        lease.force_expire().await.unwrap();
        assert!(store.items("q")[0].lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let lease = claimed(&store, Duration::from_secs(60)).await;
        drop(lease);

        for _ in 0..50 {
            if store.items("q")[0].lock_holder.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropped lease was not released");
    }
}

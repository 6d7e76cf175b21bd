//! Work queue coordinator
//!
//! Producers enqueue labeled values into per-label buffers that are flushed
//! into the store in batches. Workers claim the most urgent item for a set of
//! labels and receive a [`Lease`] over it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::buffer::{EnqueueBuffer, FlushPolicy};
use super::config::JobQueueConfig;
use super::lease::Lease;
use crate::error::{Error, Result};
use crate::persistence::{CoordinationStore, ItemFilter, NewWorkItem, MAX_PRIORITY};
use crate::reliability::{sleep_or_shutdown, FibonacciBackoff};

/// Prioritized, labeled work queue over a [`CoordinationStore`]
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lockstep::{InMemoryCoordinationStore, JobQueue, JobQueueConfig};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> lockstep::Result<()> {
/// let store = Arc::new(InMemoryCoordinationStore::new());
/// let queue = JobQueue::new(store, JobQueueConfig::new("mail"))?;
///
/// queue.enqueue("producer-1", "send", json!({"to": "a@example.com"})).await?;
///
/// let mut lease = queue.claim("worker-1", &[]).await?.expect("one item");
/// assert_eq!(lease.label().await?, "send");
/// lease.complete().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobQueue {
    store: Arc<dyn CoordinationStore>,
    config: JobQueueConfig,
    buffer: Mutex<EnqueueBuffer>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl JobQueue {
    /// Create a queue, validating its configuration
    pub fn new(store: Arc<dyn CoordinationStore>, config: JobQueueConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            queue = %config.name,
            buffer_size = config.buffer_size,
            extra_lease_ms = config.extra_lease.as_millis() as u64,
            "created job queue"
        );
        Ok(Self {
            store,
            config,
            buffer: Mutex::new(EnqueueBuffer::default()),
            shutdown_rx: None,
        })
    }

    /// Let a shutdown signal cut saturation waits short
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    // =========================================================================
    // Producing
    // =========================================================================

    /// Enqueue a value with the default priority
    pub async fn enqueue(
        &self,
        owner_tag: &str,
        label: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.enqueue_with_priority(owner_tag, label, value, self.config.default_priority)
            .await
    }

    /// Enqueue a value with an explicit priority (0 is most urgent).
    ///
    /// Creating a label's buffer first waits, bounded by the extra-lease window,
    /// while the label is saturated in the store. The wait never fails the
    /// enqueue. Due buffers are flushed before returning.
    #[instrument(skip(self, value), fields(queue = %self.config.name))]
    pub async fn enqueue_with_priority(
        &self,
        owner_tag: &str,
        label: &str,
        value: serde_json::Value,
        priority: u32,
    ) -> Result<()> {
        if value.is_null() {
            return Err(Error::InvalidArgument("value must not be null".into()));
        }
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidArgument(format!(
                "priority {priority} exceeds {MAX_PRIORITY}"
            )));
        }

        let needs_buffer = !self.buffer.lock().has_label(label);
        if needs_buffer {
            self.wait_for_capacity(label).await?;
        }

        let pending = {
            let mut buffer = self.buffer.lock();
            buffer.push(
                NewWorkItem {
                    label: label.to_string(),
                    value,
                    priority,
                    owner_tag: owner_tag.to_string(),
                },
                Instant::now(),
            );
            buffer.pending()
        };
        trace!(label, pending, "enqueued");

        self.flush().await?;
        Ok(())
    }

    /// Flush the label buffers that are due. Returns the number of items inserted.
    pub async fn flush(&self) -> Result<usize> {
        self.flush_inner(false).await
    }

    /// Flush every buffered item. Returns the number of items inserted.
    pub async fn force_flush(&self) -> Result<usize> {
        self.flush_inner(true).await
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.lock().is_buffered()
    }

    /// Hold items until a buffer fills up or ages out
    pub fn enable_buffer(&self) {
        self.buffer.lock().set_buffered(true);
    }

    /// Stop buffering and flush everything pending
    pub async fn disable_buffer(&self) -> Result<usize> {
        self.buffer.lock().set_buffered(false);
        self.force_flush().await
    }

    /// Number of buffered items not yet in the store
    pub fn pending(&self) -> usize {
        self.buffer.lock().pending()
    }

    async fn flush_inner(&self, force: bool) -> Result<usize> {
        let policy = FlushPolicy {
            buffer_size: self.config.buffer_size,
            lifetime: self.config.buffer_lifetime,
        };
        let items = self.buffer.lock().take_due(force, policy, Instant::now());
        if items.is_empty() {
            return Ok(0);
        }

        let count = items.len();
        if let Err(e) = self.store.insert_items(&self.config.name, items.clone()).await {
            self.buffer.lock().restore(items, Instant::now());
            return Err(e.into());
        }

        debug!(queue = %self.config.name, count, force, "flushed work items");
        Ok(count)
    }

    async fn wait_for_capacity(&self, label: &str) -> Result<()> {
        let threshold = self.config.saturation_threshold();
        let filter = ItemFilter::all().with_label(label);
        let mut backoff = FibonacciBackoff::new(self.config.backoff_unit, self.config.extra_lease);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            let count = self.store.count_items(&self.config.name, &filter).await?;
            if count < threshold {
                return Ok(());
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(
                    queue = %self.config.name,
                    label,
                    count,
                    threshold,
                    "label still saturated after wait window, enqueueing anyway"
                );
                return Ok(());
            };

            trace!(label, count, threshold, delay_ms = delay.as_millis() as u64, "label saturated, backing off");
            let interrupted = match shutdown_rx.as_mut() {
                Some(rx) => sleep_or_shutdown(delay, rx).await,
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if interrupted {
                warn!(queue = %self.config.name, label, "saturation wait cancelled, enqueueing anyway");
                return Ok(());
            }
        }
    }

    // =========================================================================
    // Counting
    // =========================================================================

    /// Items in the store, optionally only those tagged with `owner_tag`
    pub async fn count_jobs(&self, owner_tag: Option<&str>) -> Result<u64> {
        let mut filter = ItemFilter::all();
        if let Some(tag) = owner_tag {
            filter = filter.with_owner_tag(tag);
        }
        Ok(self.store.count_items(&self.config.name, &filter).await?)
    }

    /// Items of one label in the store, optionally only those tagged with `owner_tag`
    pub async fn count_label(&self, label: &str, owner_tag: Option<&str>) -> Result<u64> {
        let mut filter = ItemFilter::all().with_label(label);
        if let Some(tag) = owner_tag {
            filter = filter.with_owner_tag(tag);
        }
        Ok(self.store.count_items(&self.config.name, &filter).await?)
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Claim the most urgent item among `labels` (any label when empty) with
    /// the configured extra lease
    pub async fn claim(&self, claimant: &str, labels: &[String]) -> Result<Option<Lease>> {
        self.claim_with_lease(claimant, labels, self.config.extra_lease)
            .await
    }

    /// Claim with an explicit lease duration
    #[instrument(skip(self), fields(queue = %self.config.name))]
    pub async fn claim_with_lease(
        &self,
        claimant: &str,
        labels: &[String],
        extra_lease: Duration,
    ) -> Result<Option<Lease>> {
        if claimant.is_empty() {
            return Err(Error::InvalidArgument("claimant must not be empty".into()));
        }
        if extra_lease.is_zero() {
            return Err(Error::InvalidArgument("extra_lease must be positive".into()));
        }

        let item = self
            .store
            .claim_item(&self.config.name, claimant, labels, extra_lease)
            .await?;

        Ok(item.map(|item| {
            debug!(item_id = %item.id, label = %item.label, priority = item.priority, "claimed");
            Lease::new(Arc::clone(&self.store), self.config.name.clone(), item)
        }))
    }

    /// Hand a lease back to the queue
    pub async fn release(&self, lease: &mut Lease) -> Result<()> {
        lease.release().await
    }

    /// Delete a leased item from the queue
    pub async fn complete(&self, lease: &mut Lease) -> Result<()> {
        lease.complete().await
    }

    /// Claim an item and run `f` over its lease.
    ///
    /// Returns `Ok(None)` when nothing was claimable. A lease that `f` left
    /// active is released on every exit path, including when `f` fails.
    pub async fn with_lease<T, F>(
        &self,
        claimant: &str,
        labels: &[String],
        f: F,
    ) -> Result<Option<T>>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut Lease) -> BoxFuture<'a, Result<T>> + Send,
    {
        let Some(mut lease) = self.claim(claimant, labels).await? else {
            return Ok(None);
        };

        let outcome = f(&mut lease).await;
        if lease.is_active() {
            if let Err(e) = lease.release().await {
                warn!(item_id = %lease.id(), error = %e, "failed to release lease after scope");
                if outcome.is_ok() {
                    return Err(e);
                }
            }
        }

        outcome.map(Some)
    }

    /// Remove every item of this queue from the store, including claimed ones
    pub async fn drop_queue(&self) -> Result<()> {
        self.store.drop_queue(&self.config.name).await?;
        Ok(())
    }
}

//! Producer facade over a work queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::job_queue::JobQueue;
use crate::error::Result;

/// Caller-supplied production step driven by [`JobQueueProducer::run`]
#[async_trait]
pub trait Produce: Send + Sync {
    /// Enqueue the next batch of work through `producer`.
    ///
    /// Called repeatedly until one call enqueues nothing.
    async fn produce(&mut self, producer: &JobQueueProducer) -> Result<()>;
}

/// Closure adapter for [`Produce`]
pub struct FnProduce<F>(F);

#[async_trait]
impl<F> Produce for FnProduce<F>
where
    F: for<'a> FnMut(&'a JobQueueProducer) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn produce(&mut self, producer: &JobQueueProducer) -> Result<()> {
        (self.0)(producer).await
    }
}

/// Tags every item it enqueues with one owner tag, so callers can follow how
/// much of their work is still outstanding.
pub struct JobQueueProducer {
    queue: Arc<JobQueue>,
    owner_tag: String,
    priority: u32,
    callback: Option<Box<dyn Produce>>,
    enqueued: AtomicBool,
}

impl JobQueueProducer {
    /// Create a producer with a generated owner tag
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let priority = queue.config().default_priority;
        Self {
            queue,
            owner_tag: format!("op-{}", Uuid::now_v7()),
            priority,
            callback: None,
            enqueued: AtomicBool::new(false),
        }
    }

    /// Use a fixed owner tag, for example to resume tracking after a restart
    pub fn with_owner_tag(mut self, owner_tag: impl Into<String>) -> Self {
        self.owner_tag = owner_tag.into();
        self
    }

    /// Priority used by [`enqueue`](Self::enqueue)
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the production step
    pub fn set<P: Produce + 'static>(&mut self, callback: P) {
        self.callback = Some(Box::new(callback));
    }

    /// Set the production step from a closure
    pub fn set_fn<F>(&mut self, f: F)
    where
        F: for<'a> FnMut(&'a JobQueueProducer) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.set(FnProduce(f));
    }

    pub fn owner_tag(&self) -> &str {
        &self.owner_tag
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Enqueue with the producer's priority
    pub async fn enqueue(&self, label: &str, value: serde_json::Value) -> Result<()> {
        self.enqueue_with_priority(label, value, self.priority)
            .await
    }

    pub async fn enqueue_with_priority(
        &self,
        label: &str,
        value: serde_json::Value,
        priority: u32,
    ) -> Result<()> {
        self.queue
            .enqueue_with_priority(&self.owner_tag, label, value, priority)
            .await?;
        self.enqueued.store(true, Ordering::Release);
        Ok(())
    }

    /// Drive the production step until it stops enqueueing.
    ///
    /// Buffering is on for the duration of the run and everything pending is
    /// flushed at the end, also when the step fails. Returns `false` when no
    /// step was set.
    #[instrument(skip(self), fields(owner_tag = %self.owner_tag, queue = %self.queue.name()))]
    pub async fn run(&mut self) -> Result<bool> {
        let Some(mut callback) = self.callback.take() else {
            return Ok(false);
        };

        self.queue.enable_buffer();
        let outcome = self.drive(callback.as_mut()).await;
        let flushed = self.queue.disable_buffer().await;
        self.callback = Some(callback);

        if let Err(e) = &outcome {
            warn!(error = %e, "production step failed, pending items flushed");
        }
        outcome?;
        let flushed = flushed?;
        debug!(flushed, "production run finished");
        Ok(true)
    }

    async fn drive(&self, callback: &mut dyn Produce) -> Result<()> {
        loop {
            self.enqueued.store(false, Ordering::Release);
            callback.produce(self).await?;
            if !self.enqueued.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    /// Items tagged with this producer's owner tag still in the queue
    pub async fn count(&self) -> Result<u64> {
        self.queue.count_jobs(Some(&self.owner_tag)).await
    }

    /// Whether all of this producer's work has been completed
    pub async fn is_done(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Error;
    use crate::persistence::InMemoryCoordinationStore;
    use crate::queue::JobQueueConfig;

    struct Countdown {
        remaining: u32,
        calls: u32,
    }

    #[async_trait]
    impl Produce for Countdown {
        async fn produce(&mut self, producer: &JobQueueProducer) -> Result<()> {
            self.calls += 1;
            if self.remaining > 0 {
                producer.enqueue("tick", json!(self.remaining)).await?;
                self.remaining -= 1;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Produce for Failing {
        async fn produce(&mut self, producer: &JobQueueProducer) -> Result<()> {
            producer.enqueue("tick", json!(1)).await?;
            Err(Error::InvalidArgument("upstream closed".into()))
        }
    }

    fn queue() -> (Arc<InMemoryCoordinationStore>, Arc<JobQueue>) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let queue = JobQueue::new(store.clone(), JobQueueConfig::new("q")).unwrap();
        (store, Arc::new(queue))
    }

    #[tokio::test]
    async fn test_run_without_callback() {
        let (_store, queue) = queue();
        let mut producer = JobQueueProducer::new(queue);
        assert!(!producer.run().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_until_nothing_enqueued() {
        let (store, queue) = queue();
        let mut producer = JobQueueProducer::new(queue.clone()).with_owner_tag("op-test");
        producer.set(Countdown {
            remaining: 3,
            calls: 0,
        });

        assert!(producer.run().await.unwrap());
        assert_eq!(store.item_count("q"), 3);
        assert_eq!(producer.count().await.unwrap(), 3);
        assert!(!producer.is_done().await.unwrap());
        assert!(!queue.is_buffered());

        while let Some(mut lease) = queue.claim("w", &[]).await.unwrap() {
            lease.complete().await.unwrap();
        }
        assert!(producer.is_done().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_run_still_flushes() {
        let (store, queue) = queue();
        let mut producer = JobQueueProducer::new(queue.clone());
        producer.set(Failing);

        assert!(producer.run().await.is_err());
        assert_eq!(store.item_count("q"), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_closure_producer() {
        let (store, queue) = queue();
        let mut producer = JobQueueProducer::new(queue);
        let mut batches = vec![vec![1, 2], vec![3]];
        producer.set_fn(move |p| {
            let batch = batches.pop().unwrap_or_default();
            Box::pin(async move {
                for n in batch {
                    p.enqueue("n", json!(n)).await?;
                }
                Ok::<_, crate::Error>(())
            })
        });

        producer.run().await.unwrap();
        assert_eq!(store.item_count("q"), 3);
    }
}

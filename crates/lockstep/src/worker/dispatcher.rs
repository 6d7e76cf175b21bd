//! Dispatch loop
//!
//! Claims one item at a time across the labels that currently have a workable
//! handler and runs the label's handlers over the lease.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handler::{FnHandler, JobHandler};
use crate::config::{duration_millis, env_millis, option_duration_millis};
use crate::error::{Error, Result};
use crate::queue::{JobQueue, Lease};
use crate::reliability::sleep_or_shutdown;

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Identity recorded as lock holder on claimed items
    pub claimant_id: String,

    /// Lease granted per claim; the queue's extra lease when unset
    #[serde(default, with = "option_duration_millis")]
    pub extra_lease: Option<Duration>,

    /// Pause between empty cycles in [`Dispatcher::run_until_shutdown`]
    #[serde(with = "duration_millis")]
    pub idle_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            claimant_id: format!("worker-{}", Uuid::now_v7()),
            extra_lease: None,
            idle_interval: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    /// Create a new dispatcher configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Reads `LOCKSTEP_WORKER_ID`, `LOCKSTEP_WORKER_EXTRA_LEASE_MS` and
    /// `LOCKSTEP_WORKER_IDLE_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            claimant_id: std::env::var("LOCKSTEP_WORKER_ID").unwrap_or(defaults.claimant_id),
            extra_lease: env_millis("LOCKSTEP_WORKER_EXTRA_LEASE_MS").or(defaults.extra_lease),
            idle_interval: env_millis("LOCKSTEP_WORKER_IDLE_MS").unwrap_or(defaults.idle_interval),
        }
    }

    /// Set the claimant id
    pub fn with_claimant_id(mut self, id: impl Into<String>) -> Self {
        self.claimant_id = id.into();
        self
    }

    /// Set the lease granted per claim
    pub fn with_extra_lease(mut self, lease: Duration) -> Self {
        self.extra_lease = Some(lease);
        self
    }

    /// Set the idle interval
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.claimant_id.trim().is_empty() {
            return Err(Error::Configuration("claimant_id must not be empty".into()));
        }
        if self.extra_lease.is_some_and(|d| d.is_zero()) {
            return Err(Error::Configuration("extra_lease must be positive".into()));
        }
        Ok(())
    }
}

/// Runs registered handlers over claimed items
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lockstep::{Dispatcher, DispatcherConfig, InMemoryCoordinationStore, JobQueue, JobQueueConfig};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> lockstep::Result<()> {
/// let store = Arc::new(InMemoryCoordinationStore::new());
/// let queue = Arc::new(JobQueue::new(store, JobQueueConfig::new("mail"))?);
/// queue.enqueue("producer-1", "send", json!({"to": "a@example.com"})).await?;
///
/// let mut dispatcher = Dispatcher::new(queue, DispatcherConfig::new())?;
/// dispatcher.add_fn("send", |_label, lease| Box::pin(async move { lease.complete().await }));
///
/// assert!(dispatcher.run().await?);
/// assert!(!dispatcher.run().await?);
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    config: DispatcherConfig,
    handlers: Vec<(String, Vec<Arc<dyn JobHandler>>)>,
}

impl Dispatcher {
    /// Create a dispatcher, validating its configuration
    pub fn new(queue: Arc<JobQueue>, config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            config,
            handlers: Vec::new(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Register a handler for `label`. Handlers of one label run in
    /// registration order.
    pub fn add<H: JobHandler>(&mut self, label: impl Into<String>, handler: H) -> &mut Self {
        self.add_arc(label, Arc::new(handler))
    }

    /// Register a shared handler for `label`
    pub fn add_arc(&mut self, label: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        let label = label.into();
        match self.handlers.iter_mut().find(|(l, _)| *l == label) {
            Some((_, handlers)) => handlers.push(handler),
            None => self.handlers.push((label, vec![handler])),
        }
        self
    }

    /// Register a closure handler for `label`
    pub fn add_fn<F>(&mut self, label: impl Into<String>, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a str, &'a mut Lease) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.add(label, FnHandler::new(f))
    }

    /// Labels with at least one registered handler
    pub fn labels(&self) -> Vec<&str> {
        self.handlers.iter().map(|(l, _)| l.as_str()).collect()
    }

    /// Labels with at least one handler that is workable right now
    pub fn workable_labels(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|(label, handlers)| handlers.iter().any(|h| h.is_workable(label)))
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Run one dispatch cycle.
    ///
    /// Returns `false` when no label is workable or nothing could be claimed.
    /// A lease no handler terminated is released before returning, also when a
    /// handler fails; the item will be offered again on a later cycle.
    #[instrument(skip(self), fields(claimant = %self.config.claimant_id, queue = %self.queue.name()))]
    pub async fn run(&self) -> Result<bool> {
        let labels = self.workable_labels();
        if labels.is_empty() {
            debug!("no workable labels");
            return Ok(false);
        }

        let extra_lease = self
            .config
            .extra_lease
            .unwrap_or(self.queue.config().extra_lease);
        let Some(mut lease) = self
            .queue
            .claim_with_lease(&self.config.claimant_id, &labels, extra_lease)
            .await?
        else {
            return Ok(false);
        };

        let label = lease.label().await?.to_string();
        let outcome = self.invoke(&label, &mut lease).await;

        if lease.is_active() {
            if let Err(e) = lease.release().await {
                warn!(item_id = %lease.id(), error = %e, "failed to release lease after dispatch");
                if outcome.is_ok() {
                    return Err(e);
                }
            }
        }

        outcome.map(|()| true)
    }

    async fn invoke(&self, label: &str, lease: &mut Lease) -> Result<()> {
        let Some((_, handlers)) = self.handlers.iter().find(|(l, _)| l == label) else {
            return Err(Error::Coordination(format!(
                "claimed item with unregistered label '{label}'"
            )));
        };

        debug!(label, handlers = handlers.len(), item_id = %lease.id(), "dispatching");
        for handler in handlers.iter().filter(|h| h.is_workable(label)) {
            handler
                .assign_job(label, lease)
                .await
                .map_err(|e| match e {
                    Error::Handler { .. } | Error::ExpiredLease | Error::ExpiredResource => e,
                    other => Error::handler(label, other.to_string()),
                })?;
        }
        Ok(())
    }

    /// Run cycles until one finds no work. Returns the number of items dispatched.
    pub async fn drain(&self) -> Result<usize> {
        let mut dispatched = 0;
        while self.run().await? {
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Run cycles until shutdown is signaled, pausing for the idle interval
    /// whenever a cycle finds no work.
    ///
    /// Handler failures and lost leases are logged and the loop continues; store
    /// and coordination failures stop it.
    pub async fn run_until_shutdown(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<usize> {
        info!(
            claimant = %self.config.claimant_id,
            queue = %self.queue.name(),
            labels = ?self.labels(),
            "starting dispatcher"
        );

        let mut dispatched = 0;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.run().await {
                Ok(true) => dispatched += 1,
                Ok(false) => {
                    if sleep_or_shutdown(self.config.idle_interval, &mut shutdown_rx).await {
                        break;
                    }
                }
                Err(e @ Error::Handler { .. }) => error!(error = %e, "handler failed"),
                Err(e) if e.is_retryable() => warn!(error = %e, "lease lost during dispatch"),
                Err(e) => return Err(e),
            }
        }

        info!(dispatched, "dispatcher stopped");
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::persistence::InMemoryCoordinationStore;
    use crate::queue::JobQueueConfig;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        complete: bool,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn assign_job(&self, label: &str, lease: &mut Lease) -> Result<()> {
            self.log.lock().push(format!("{}:{}", self.name, label));
            if self.complete {
                lease.complete().await?;
            }
            Ok(())
        }
    }

    struct Toggle {
        workable: AtomicBool,
    }

    #[async_trait]
    impl JobHandler for Toggle {
        fn is_workable(&self, _label: &str) -> bool {
            self.workable.load(Ordering::SeqCst)
        }

        async fn assign_job(&self, _label: &str, lease: &mut Lease) -> Result<()> {
            lease.complete().await
        }
    }

    fn setup() -> (Arc<InMemoryCoordinationStore>, Arc<JobQueue>) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let queue = JobQueue::new(store.clone(), JobQueueConfig::new("q")).unwrap();
        (store, Arc::new(queue))
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig::new().with_claimant_id("worker-test")
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(config().with_claimant_id(" ").validate().is_err());
        assert!(config()
            .with_extra_lease(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_no_handlers_returns_false() {
        let (_store, queue) = setup();
        queue.enqueue("op", "a", json!(1)).await.unwrap();

        let dispatcher = Dispatcher::new(queue, config()).unwrap();
        assert!(!dispatcher.run().await.unwrap());
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (store, queue) = setup();
        queue.enqueue("op", "a", json!(1)).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher
            .add(
                "a",
                Recorder {
                    name: "first",
                    log: log.clone(),
                    complete: false,
                },
            )
            .add(
                "a",
                Recorder {
                    name: "second",
                    log: log.clone(),
                    complete: true,
                },
            );

        assert!(dispatcher.run().await.unwrap());
        assert_eq!(*log.lock(), vec!["first:a", "second:a"]);
        assert_eq!(store.item_count("q"), 0);
    }

    #[tokio::test]
    async fn test_unworkable_labels_are_not_claimed() {
        let (store, queue) = setup();
        queue.enqueue("op", "paused", json!(1)).await.unwrap();

        let toggle = Arc::new(Toggle {
            workable: AtomicBool::new(false),
        });
        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher.add_arc("paused", toggle.clone());

        assert!(!dispatcher.run().await.unwrap());
        assert!(store.items("q")[0].lock_holder.is_none());

        toggle.workable.store(true, Ordering::SeqCst);
        assert!(dispatcher.run().await.unwrap());
        assert_eq!(store.item_count("q"), 0);
    }

    #[tokio::test]
    async fn test_unterminated_lease_is_released() {
        let (store, queue) = setup();
        queue.enqueue("op", "a", json!(1)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher.add_fn("a", move |_label, _lease| {
            seen.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        assert!(dispatcher.run().await.unwrap());
        assert!(dispatcher.run().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.items("q")[0].lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_handler_failure_releases_and_propagates() {
        let (store, queue) = setup();
        queue.enqueue("op", "a", json!(1)).await.unwrap();

        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher.add_fn("a", |_label, _lease| {
            Box::pin(async { Err(Error::InvalidArgument("bad payload".into())) })
        });

        let err = dispatcher.run().await.unwrap_err();
        match err {
            Error::Handler { label, message } => {
                assert_eq!(label, "a");
                assert!(message.contains("bad payload"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.items("q")[0].lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_lost_lease_stays_retryable() {
        let (store, queue) = setup();
        queue.enqueue("op", "a", json!(1)).await.unwrap();

        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher.add_fn("a", |_label, lease| {
            Box::pin(async move {
                lease.force_expire().await?;
                lease.value().await?;
                Ok::<_, Error>(())
            })
        });

        let err = dispatcher.run().await.unwrap_err();
        assert!(matches!(err, Error::ExpiredLease));
        assert!(err.is_retryable());
        assert!(store.items("q")[0].lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_drain_processes_everything() {
        let (store, queue) = setup();
        for n in 0..5 {
            queue.enqueue("op", "a", json!(n)).await.unwrap();
        }

        let mut dispatcher = Dispatcher::new(queue, config()).unwrap();
        dispatcher.add_fn("a", |_label, lease| Box::pin(async move { lease.complete().await }));

        assert_eq!(dispatcher.drain().await.unwrap(), 5);
        assert_eq!(store.item_count("q"), 0);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (store, queue) = setup();
        for n in 0..3 {
            queue.enqueue("op", "a", json!(n)).await.unwrap();
        }

        let mut dispatcher = Dispatcher::new(
            queue,
            config().with_idle_interval(Duration::from_millis(10)),
        )
        .unwrap();
        dispatcher.add_fn("a", |_label, lease| Box::pin(async move { lease.complete().await }));

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(async move { dispatcher.run_until_shutdown(rx).await });

        for _ in 0..100 {
            if store.item_count("q") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        assert_eq!(worker.await.unwrap().unwrap(), 3);
    }
}

//! Job handler capability

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::queue::Lease;

/// Work performed for claimed items of one label
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use lockstep::{JobHandler, Lease, Result};
///
/// struct SendMail;
///
/// #[async_trait]
/// impl JobHandler for SendMail {
///     async fn assign_job(&self, _label: &str, lease: &mut Lease) -> Result<()> {
///         let _recipient = lease.value().await?["to"].clone();
///         lease.complete().await
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Whether the handler can take work for `label` right now
    fn is_workable(&self, _label: &str) -> bool {
        true
    }

    /// Process a claimed item.
    ///
    /// Completing or releasing the lease is up to the handler; a lease still
    /// active after every handler ran is released by the dispatcher.
    async fn assign_job(&self, label: &str, lease: &mut Lease) -> Result<()>;
}

/// Closure adapter for [`JobHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: for<'a> Fn(&'a str, &'a mut Lease) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a str, &'a mut Lease) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn assign_job(&self, label: &str, lease: &mut Lease) -> Result<()> {
        (self.f)(label, lease).await
    }
}

//! Error types for the coordination primitives

use thiserror::Error;

use crate::persistence::StoreError;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by queues, leases, dispatchers and resource pools
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, rejected at construction
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad call argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A conditional write matched an impossible number of records, or
    /// shared state violates an invariant
    #[error("coordination failure: {0}")]
    Coordination(String),

    /// The store adapter failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The work lease elapsed or was lost to another claimant
    #[error("lease expired")]
    ExpiredLease,

    /// The pool membership lease elapsed before it could be renewed
    #[error("resource pool membership expired")]
    ExpiredResource,

    /// Release after release, or use after release
    #[error("already released")]
    AlreadyReleased,

    /// A dispatch handler failed; its lease has been released
    #[error("handler for label '{label}' failed: {message}")]
    Handler { label: String, message: String },
}

impl Error {
    /// Whether re-claiming (or re-creating the pool) can make progress.
    ///
    /// Store and coordination failures are never retried by this crate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExpiredLease | Error::ExpiredResource)
    }

    /// Build a [`Error::Handler`] for the given label
    pub fn handler(label: &str, message: impl Into<String>) -> Self {
        Error::Handler {
            label: label.to_string(),
            message: message.into(),
        }
    }
}

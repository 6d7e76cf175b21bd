//! # Lockstep
//!
//! Lease-based coordination for processes that share nothing but a store.
//!
//! ## Features
//!
//! - **Work queue**: prioritized, labeled items claimed under a time-bounded lease
//! - **Buffered enqueue**: per-label batching with size and age flush triggers
//! - **Backpressure**: producers wait with bounded Fibonacci backoff while the queue is saturated
//! - **Dispatch loop**: routes claimed items to registered handlers by label
//! - **Resource pool**: members split a shared resource set and take over lapsed members' share
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │   JobQueueProducer       │     │       Dispatcher         │
//! │  (owner tag, buffering)  │     │  (claim, route, release) │
//! └──────────────────────────┘     └──────────────────────────┘
//!              │                                │
//!              ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobQueue                             │
//! │  (enqueue buffer, saturation wait, claim-with-timeout)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CoordinationStore                         │
//! │  (PostgreSQL: lockstep_work_items, pool_members, resources) │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ResourcePool                           │
//! │  (membership lease, quota rebalancing, local allocation)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use lockstep::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lockstep::Result<()> {
//! let store = Arc::new(InMemoryCoordinationStore::new());
//! let queue = JobQueue::new(store, JobQueueConfig::new("mail"))?;
//!
//! queue.enqueue("signup-42", "send_welcome", json!({"to": "a@example.com"})).await?;
//!
//! let mut lease = queue
//!     .claim("worker-1", &["send_welcome".to_string()])
//!     .await?
//!     .expect("item is claimable");
//! assert_eq!(lease.label().await?, "send_welcome");
//! lease.complete().await?;
//! assert_eq!(queue.count_jobs(None).await?, 0);
//! # Ok(())
//! # }
//! ```

mod config;
pub mod error;
pub mod persistence;
pub mod pool;
pub mod queue;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::persistence::{
        CoordinationStore, InMemoryCoordinationStore, PostgresCoordinationStore, StoreError,
    };
    pub use crate::pool::{
        ArbiterPolicy, LowestMemberArbiter, NoArbiter, PoolStatus, ResourceHandle, ResourcePool,
        ResourcePoolConfig,
    };
    pub use crate::queue::{
        FnProduce, JobQueue, JobQueueConfig, JobQueueProducer, Lease, LeaseState, Produce,
    };
    pub use crate::reliability::FibonacciBackoff;
    pub use crate::worker::{Dispatcher, DispatcherConfig, FnHandler, JobHandler};
}

// Re-export key types at crate root
pub use error::{Error, Result};
pub use persistence::{
    CoordinationStore, InMemoryCoordinationStore, PostgresCoordinationStore, StoreError,
};
pub use pool::{
    ArbiterPolicy, LowestMemberArbiter, NoArbiter, PoolStatus, ResourceHandle, ResourcePool,
    ResourcePoolConfig,
};
pub use queue::{FnProduce, JobQueue, JobQueueConfig, JobQueueProducer, Lease, LeaseState, Produce};
pub use worker::{Dispatcher, DispatcherConfig, FnHandler, JobHandler};

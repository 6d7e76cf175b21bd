//! Prioritized work queue
//!
//! This module provides:
//! - [`JobQueue`] - buffered enqueue and atomic claim-with-timeout
//! - [`Lease`] - exclusive, time-bounded handle over a claimed item
//! - [`JobQueueProducer`] - producer facade that tracks its own outstanding work

mod buffer;
mod config;
mod job_queue;
mod lease;
mod producer;

pub use config::JobQueueConfig;
pub use job_queue::JobQueue;
pub use lease::{Lease, LeaseState};
pub use producer::{FnProduce, JobQueueProducer, Produce};

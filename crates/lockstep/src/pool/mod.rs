//! Resource pool coordination
//!
//! This module provides:
//! - [`ResourcePool`] - membership, quota rebalancing and local allocation
//! - [`ResourceHandle`] - a resource taken from the pool
//! - [`ArbiterPolicy`] - who absorbs the quota remainder

mod allocation;
mod config;
mod coordinator;
mod handle;

pub use allocation::{
    expected_quota, ArbiterPolicy, BlockedBuckets, LocalStatus, LowestMemberArbiter, NoArbiter,
    PoolStatus, RenewalWindows, ResourceState, ResourceStatus,
};
pub use config::ResourcePoolConfig;
pub use coordinator::ResourcePool;
pub use handle::ResourceHandle;

//! Persistence layer for coordination state
//!
//! This module provides:
//! - [`CoordinationStore`] trait, the conditional-write contract the coordinators rely on
//! - [`InMemoryCoordinationStore`] for testing
//! - [`PostgresCoordinationStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use postgres::PostgresCoordinationStore;
pub(crate) use store::lease_offset;
pub use store::{
    unlocked_sentinel, CoordinationStore, ItemFilter, LeaseFingerprint, MAX_PRIORITY, NewWorkItem,
    PoolMembership, ResourceRecord, StoreError, WorkItem,
};

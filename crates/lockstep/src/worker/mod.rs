//! Worker side of the work queue
//!
//! This module provides:
//! - [`JobHandler`] - capability implemented by the code that processes items
//! - [`Dispatcher`] - claims items and runs the matching handlers over them

mod dispatcher;
mod handler;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handler::{FnHandler, JobHandler};

//! Reliability patterns for coordination
//!
//! This module provides:
//! - [`FibonacciBackoff`] - Bounded Fibonacci backoff for saturation waits
//! - [`sleep_or_shutdown`] - A sleep that a shutdown signal can cut short

mod backoff;

pub use backoff::{sleep_or_shutdown, FibonacciBackoff};

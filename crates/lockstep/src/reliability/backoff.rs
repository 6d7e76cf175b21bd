//! Bounded Fibonacci backoff with cancellable waits

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Fibonacci backoff bounded by a total wait window
///
/// Delays grow as 1, 1, 2, 3, 5, ... units. The delay that would cross the end
/// of the window is clipped to it, and once the window has elapsed no further
/// delay is handed out.
///
/// # Example
///
/// ```
/// use lockstep::reliability::FibonacciBackoff;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut backoff = FibonacciBackoff::new(Duration::from_millis(10), Duration::from_secs(60));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(30)));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    unit: Duration,
    previous: u32,
    current: u32,
    deadline: Instant,
}

impl FibonacciBackoff {
    /// Start a backoff whose window begins now
    pub fn new(unit: Duration, window: Duration) -> Self {
        Self {
            unit,
            previous: 0,
            current: 1,
            deadline: Instant::now() + window,
        }
    }

    /// Time left before the window closes
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the window has elapsed
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Next delay to wait, or `None` once the window has elapsed
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return None;
        }

        let delay = self.unit.saturating_mul(self.current);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;

        Some(delay.min(remaining))
    }
}

/// Sleep for `delay` unless the shutdown signal fires first.
///
/// Returns `true` when the wait was cut short by shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let until = Instant::now() + delay;
    tokio::select! {
        _ = tokio::time::sleep_until(until) => false,
        changed = shutdown.changed() => {
            match changed {
                Ok(()) if *shutdown.borrow() => {
                    debug!("Shutdown signal received during wait");
                    true
                }
                // Sender dropped or flipped back: finish the wait normally
                _ => {
                    tokio::time::sleep_until(until).await;
                    false
                }
            }
        }
    }
}

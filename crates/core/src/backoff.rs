//! Exponential reconnect backoff with a give-up ceiling.
//!
//! The reflector loop doubles its reconnect delay on every generic failure
//! and abandons the loop once the next delay would exceed the ceiling.
//! Every successfully processed watch event resets the delay to the floor,
//! so a stream that connects and then dies still gets credit for whatever
//! it managed to deliver.

use std::time::Duration;

/// Default floor: first retry after 100ms.
pub const DEFAULT_FLOOR: Duration = Duration::from_millis(100);
/// Default give-up ceiling: a delay beyond 30s means the API server never
/// recovered and the reflector escalates instead of retrying forever.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Next delay to sleep before reconnecting, or `None` once the delay
    /// has grown past the ceiling and the caller should give up.
    pub fn next(&mut self) -> Option<Duration> {
        if self.current > self.ceiling {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }

    /// Drop back to the floor after forward progress.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING)
    }
}

use std::time::Duration;

/// Bounded exponential reconnect schedule: `base × 2^attempt`, at most
/// `max_retries` times between two successful opens.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            retries: 0,
        }
    }

    /// Delay before the next reconnect attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        self.retries += 1;
        Some(self.base.saturating_mul(factor))
    }

    /// Called when a connection opens.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 5)
    }
}

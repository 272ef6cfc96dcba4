use std::time::Duration;

/// Exponential backoff, doubling up to a cap
///
/// ```text
/// next_delay(): 2s, 4s, 8s, ... 60s, 60s
/// reset():      back to 2s
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay used by delivery workers between reconnects (2s to 60s)
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }

    /// Delay used while waiting for the group coordinator (1s to 30s)
    pub fn coordinator() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Delay to wait now; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Delay the next call to `next_delay` will return
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

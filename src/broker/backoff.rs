/// Reconnect delay policy for the upstream feed
use std::time::Duration;

/// Capped exponential backoff, doubling on each failed connect attempt
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        ReconnectBackoff {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait after a failed attempt; the next one waits twice as long
    pub fn on_connect_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay to wait after a session that was up ends; then back to base
    pub fn on_session_ended(&mut self) -> Duration {
        let delay = self.current;
        self.reset();
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

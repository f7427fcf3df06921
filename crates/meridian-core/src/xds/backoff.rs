//! Reconnect backoff.
//!
//! <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>

use std::time::Duration;

use crate::bootstrap::BackoffConfig;

#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self { config, current }
    }

    /// Return to the initial backoff. Called once a stream has received a
    /// response.
    pub(crate) fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// The next time to wait before reconnecting. Every call increases the
    /// base backoff up to the configured max.
    pub(crate) fn next_backoff(&mut self) -> Duration {
        let base = self.current;

        let next = base.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(next).min(self.config.max);

        let jitter = self.config.jitter;
        let factor = 1.0 + jitter * (crate::rand::random::<f64>() * 2.0 - 1.0);
        base.mul_f64(factor.max(0.0))
    }
}

//! Retry delays for transient failures.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio_util::sync::CancellationToken;

/// Exponentially growing, jittered delays between `min` and `max`.
///
/// The schedule never runs out; once the exponential builder is exhausted
/// every further delay is `max`. Jitter never pushes a delay past `max`.
pub(crate) struct RetrySchedule {
    delays: ExponentialBackoff,
    max_delay: Duration,
    attempts: u32,
}

impl RetrySchedule {
    pub(crate) fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let delays = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(max_delay)
            .with_jitter()
            .without_max_times()
            .build();

        Self {
            delays,
            max_delay,
            attempts: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        self.delays
            .next()
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Attempts made so far
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep for the next delay. Returns `false` if cancelled first.
    pub(crate) async fn wait(&mut self, token: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;

/// How a supervised consumer retries failed start attempts.
///
/// Delays start at `initial_delay` and are multiplied by `factor` after every failure, up to
/// `max_delay`. Once `max_attempts` attempts have failed the consumer gives up and records the
/// failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The delays to wait between attempts: one fewer than `max_attempts`.
    pub fn backoff(&self) -> ExponentialBackoff {
        let retries = self.max_attempts.saturating_sub(1);
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(usize::try_from(retries).unwrap_or(usize::MAX))
            .build()
    }
}

/// Tunables shared by every consumer started by a [`Dispatcher`](crate::commands::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisionPolicy {
    /// How long a subscriber waits, after its handler panicked, before requeuing the message.
    pub reject_penalty: Duration,
    pub retry: RetryPolicy,
    /// How long a restart waits for the consumer to wind down before giving up.
    pub stop_timeout: Duration,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            reject_penalty: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

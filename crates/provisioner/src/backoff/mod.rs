//! Provides the wait timing between attempts of a readiness poll.
use std::time::Duration;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` that always waits the same interval.
///
/// Status polling against the orchestration service and SSH probes both run
/// on a fixed cadence.
pub struct FixedBackoffStrategy {
    interval: Duration,
}

impl FixedBackoffStrategy {
    /// Create a strategy that waits `interval` between attempts.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackoffStrategy for FixedBackoffStrategy {
    fn next_duration(&mut self) -> Duration {
        self.interval
    }
}

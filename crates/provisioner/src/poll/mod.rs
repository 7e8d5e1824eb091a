//! Bounded-retry polling for conditions that converge asynchronously.
//!
//! [`ReadinessPoller::poll_until`] is used for three waits: a stack reaching
//! a terminal create status, a deleted stack disappearing and an instance
//! answering over SSH. Each wait supplies its own [`RetryPolicy`].
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backoff::{BackoffStrategy, FixedBackoffStrategy};

/// What to do when a bounded poll runs out of attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Raise [`PollError::Timeout`].
    Fail,
    /// Return [`PollResult::Exhausted`] with the last observation.
    ReturnLast,
}

/// How often and for how long to poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    interval: Duration,
    timeout_action: TimeoutAction,
    ceiling: Option<Duration>,
}

impl RetryPolicy {
    /// Evaluate at most `max_attempts` times (at least once), `interval` apart.
    pub fn bounded(max_attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts.max(1)),
            interval,
            timeout_action: TimeoutAction::Fail,
            ceiling: None,
        }
    }

    /// Enough attempts `interval` apart to cover `total`.
    pub fn covering(total: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            let whole = total.as_millis() / interval.as_millis().max(1);
            let rem = total.as_millis() % interval.as_millis().max(1);
            (whole + u128::from(rem > 0)).min(u128::from(u32::MAX)) as u32
        };
        RetryPolicy::bounded(attempts, interval)
    }

    /// Evaluate until done with no attempt cap, giving up once `ceiling` has
    /// elapsed.
    pub fn unbounded(interval: Duration, ceiling: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            interval,
            timeout_action: TimeoutAction::Fail,
            ceiling: Some(ceiling),
        }
    }

    /// Replace the action taken when attempts run out.
    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Add (or replace) a wall-clock ceiling on the whole poll.
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// The attempt cap, `None` when unbounded
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// The wait between two evaluations
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// What happens when the attempt cap is hit
    pub fn timeout_action(&self) -> TimeoutAction {
        self.timeout_action
    }

    /// The wall-clock ceiling, if any
    pub fn ceiling(&self) -> Option<Duration> {
        self.ceiling
    }
}

/// The verdict of one evaluation of a poll predicate.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The condition holds.
    Done(T),
    /// The condition can never hold; stop now.
    Failed(String),
    /// Not yet. Carries a description of what was observed, for diagnostics.
    Pending(String),
}

/// The successful end of a poll.
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult<T> {
    /// The predicate reported done.
    Done(T),
    /// Attempts ran out under [`TimeoutAction::ReturnLast`].
    Exhausted(Option<String>),
}

/// Errors that end a poll.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The condition did not hold in time.
    #[error("timed out waiting for {what} after {attempts} attempts (last observed: {})", .last_observed.as_deref().unwrap_or("nothing"))]
    Timeout {
        /// What was being waited for
        what: String,
        /// How many times the predicate was evaluated
        attempts: u32,
        /// The last pending observation
        last_observed: Option<String>,
    },
    /// The predicate reported a terminal failure.
    #[error("{what} failed: {cause}")]
    Failed {
        /// What was being waited for
        what: String,
        /// The reported cause
        cause: String,
    },
    /// The poll was cancelled.
    #[error("cancelled while waiting for {what}")]
    Cancelled {
        /// What was being waited for
        what: String,
    },
}

#[derive(Default)]
struct Progress {
    attempts: u32,
    last_observed: Option<String>,
}

/// Evaluates predicates on a fixed cadence until they converge.
#[derive(Clone, Debug, Default)]
pub struct ReadinessPoller {
    cancel: CancellationToken,
}

impl ReadinessPoller {
    /// Create a poller that stops waiting as soon as `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        ReadinessPoller { cancel }
    }

    /// Evaluate `predicate` until it reports done, reports failure, or the
    /// policy is exhausted.
    ///
    /// The first evaluation happens immediately; the interval is only waited
    /// between evaluations.
    pub async fn poll_until<T, F, Fut>(
        &self,
        what: &str,
        policy: &RetryPolicy,
        mut predicate: F,
    ) -> Result<PollResult<T>, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PollOutcome<T>>,
    {
        let mut progress = Progress::default();
        match policy.ceiling {
            Some(ceiling) => {
                let attempts = self.attempts(what, policy, &mut predicate, &mut progress);
                let outcome = tokio::time::timeout(ceiling, attempts).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(what, ?ceiling, "Poll ceiling reached");
                        Err(PollError::Timeout {
                            what: what.to_owned(),
                            attempts: progress.attempts,
                            last_observed: progress.last_observed,
                        })
                    }
                }
            }
            None => {
                self.attempts(what, policy, &mut predicate, &mut progress)
                    .await
            }
        }
    }

    async fn attempts<T, F, Fut>(
        &self,
        what: &str,
        policy: &RetryPolicy,
        predicate: &mut F,
        progress: &mut Progress,
    ) -> Result<PollResult<T>, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PollOutcome<T>>,
    {
        let mut backoff = FixedBackoffStrategy::new(policy.interval);
        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    what: what.to_owned(),
                });
            }

            progress.attempts += 1;
            match predicate().await {
                PollOutcome::Done(value) => {
                    debug!(what, attempts = progress.attempts, "Condition reached");
                    return Ok(PollResult::Done(value));
                }
                PollOutcome::Failed(cause) => {
                    return Err(PollError::Failed {
                        what: what.to_owned(),
                        cause,
                    });
                }
                PollOutcome::Pending(observed) => {
                    trace!(what, attempt = progress.attempts, %observed, "Still waiting");
                    progress.last_observed = Some(observed);
                }
            }

            if let Some(max) = policy.max_attempts {
                if progress.attempts >= max {
                    return match policy.timeout_action {
                        TimeoutAction::Fail => Err(PollError::Timeout {
                            what: what.to_owned(),
                            attempts: progress.attempts,
                            last_observed: progress.last_observed.take(),
                        }),
                        TimeoutAction::ReturnLast => {
                            Ok(PollResult::Exhausted(progress.last_observed.take()))
                        }
                    };
                }
            }

            tokio::select! {
                _ = backoff.wait() => {}
                _ = self.cancel.cancelled() => {
                    return Err(PollError::Cancelled { what: what.to_owned() });
                }
            }
        }
    }
}

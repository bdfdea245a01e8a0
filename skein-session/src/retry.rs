//! Retry policies consulted when a session loses its stream.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::status::SessionStatus;

/// What the session knows when it asks whether to retry.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Consecutive failed attempts, starting at 1.
    pub attempt: u32,
    /// Time since the first failure of the current streak.
    pub elapsed: Duration,
    /// The failure being handled.
    pub status: SessionStatus,
}

/// A retry policy's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after the given delay.
    Retry(Duration),
    /// Give up; the session closes.
    Stop,
}

/// Decides whether a failed session reconnects.
pub trait RetryPolicy: Send + Sync {
    /// Returns the decision for one failure.
    fn decide(&self, context: &RetryContext) -> RetryDecision;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn decide(&self, _context: &RetryContext) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Exponential backoff with full jitter, bounded by attempts and total time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffPolicy {
    /// Delay cap for the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts after which the policy stops.
    pub max_attempts: u32,
    /// Total time after which the policy stops.
    pub max_elapsed: Duration,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            max_attempts: 20,
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl ExponentialBackoffPolicy {
    /// Creates a policy for testing: tiny delays, few attempts.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
            max_elapsed: Duration::from_secs(5),
        }
    }

    /// Returns the delay ceiling for `attempt` before jitter.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1 << shift)
            .min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn decide(&self, context: &RetryContext) -> RetryDecision {
        if !context.status.code.is_retryable()
            || context.attempt > self.max_attempts
            || context.elapsed >= self.max_elapsed
        {
            return RetryDecision::Stop;
        }
        let ceiling = self.ceiling(context.attempt);
        let jittered = rand::thread_rng().gen_range(Duration::ZERO..=ceiling);
        RetryDecision::Retry(jittered)
    }
}

/// Consecutive failures of one session, reset by a successful init.
#[derive(Debug, Default)]
pub(crate) struct RetryStreak {
    current: Option<(u32, Instant)>,
}

impl RetryStreak {
    /// Records one failure and asks `policy` what to do about it.
    ///
    /// Non-retryable statuses stop without consulting the policy.
    pub(crate) fn on_failure(
        &mut self,
        policy: &dyn RetryPolicy,
        status: &SessionStatus,
    ) -> RetryDecision {
        let (attempt, started) = self.current.get_or_insert_with(|| (0, Instant::now()));
        *attempt += 1;
        if !status.code.is_retryable() {
            return RetryDecision::Stop;
        }
        policy.decide(&RetryContext {
            attempt: *attempt,
            elapsed: started.elapsed(),
            status: status.clone(),
        })
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

//! Per-node retry engine.
//!
//! Wraps the repeated `execute()` calls of one handler. Each attempt is
//! bounded by the node's timeout; a failure whose kind is on the policy's
//! allow-list is retried after the policy's backoff until `max_attempts` is
//! reached.

use crate::config::RetryPolicy;
use crate::errors::TaskError;
use crate::handler::{TaskHandler, TaskOutputs};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Source of backoff delays.
///
/// Tests swap in a clock that returns at once so backoff can be observed
/// without waiting.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Progress reported while retrying.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Attempt `attempt` (1-based) is about to call `execute()`.
    AttemptStarted {
        /// Attempt number.
        attempt: u32,
    },
    /// Attempt `attempt` failed and another follows after `delay`.
    RetryScheduled {
        /// The failed attempt.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
        /// The error that triggered the retry.
        error: TaskError,
    },
}

/// Final result of a retried execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    /// Outputs of the successful attempt, or the last error.
    pub result: Result<TaskOutputs, TaskError>,
    /// Attempts made.
    pub attempts: u32,
}

/// Drives a handler's `execute()` under a retry policy.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RetryEngine {
    /// Creates an engine using the tokio timer.
    #[must_use]
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replaces the clock used for backoff.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `handler.execute()` until it succeeds, fails permanently or runs
    /// out of attempts. `observer` sees every attempt and scheduled retry.
    pub async fn execute(
        &self,
        handler: &mut dyn TaskHandler,
        observer: &mut (dyn FnMut(RetryEvent) + Send),
    ) -> RetryOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            observer(RetryEvent::AttemptStarted { attempt });

            let result = match tokio::time::timeout(self.timeout, handler.execute()).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::timeout(self.timeout)),
            };

            let error = match result {
                Ok(outputs) => {
                    return RetryOutcome {
                        result: Ok(outputs),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if attempt >= max_attempts || !self.policy.is_retryable(&error) {
                debug!(
                    attempt,
                    max_attempts,
                    error = %error,
                    "Giving up"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.policy.delay_for(attempt);
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after error"
            );
            observer(RetryEvent::RetryScheduled { attempt, delay, error });
            self.clock.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingTask, RecordingClock};
    use pretty_assertions::assert_eq;

    fn engine(policy: RetryPolicy, clock: &Arc<RecordingClock>) -> RetryEngine {
        RetryEngine::new(policy, Duration::from_secs(5)).with_clock(clock.clone())
    }

    #[tokio::test]
    async fn test_exponential_backoff_delays() {
        let clock = Arc::new(RecordingClock::new());
        let policy = RetryPolicy::new().with_max_attempts(3).with_delay_seconds(5.0);
        let mut task = FailingTask::new("ConnectionError");
        let mut events = Vec::new();

        let outcome = engine(policy, &clock)
            .execute(&mut task, &mut |e| events.push(e))
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap_err().kind_name(), "ConnectionError");
        assert_eq!(clock.delays(), vec![Duration::from_secs(5), Duration::from_secs(10)]);
        assert_eq!(task.executions(), 3);
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn test_constant_delay_without_backoff() {
        let clock = Arc::new(RecordingClock::new());
        let policy = RetryPolicy::new()
            .with_max_attempts(4)
            .with_delay_seconds(2.0)
            .with_exponential_backoff(false);
        let mut task = FailingTask::new("TimeoutError");

        engine(policy, &clock).execute(&mut task, &mut |_| {}).await;

        assert_eq!(clock.delays(), vec![Duration::from_secs(2); 3]);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let clock = Arc::new(RecordingClock::new());
        let mut task = FailingTask::new("ValueError");

        let outcome = engine(RetryPolicy::new(), &clock).execute(&mut task, &mut |_| {}).await;

        assert_eq!(outcome.attempts, 1);
        assert!(clock.delays().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let clock = Arc::new(RecordingClock::new());
        let mut task = FailingTask::new("ConnectionError").succeeding_after(2);

        let outcome = engine(RetryPolicy::new(), &clock).execute(&mut task, &mut |_| {}).await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_ok());
        assert_eq!(clock.delays().len(), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let clock = Arc::new(RecordingClock::new());
        let policy = RetryPolicy::new().with_max_attempts(2).with_delay_seconds(0.0);
        let mut task = FailingTask::new("ConnectionError").hanging();

        let outcome = RetryEngine::new(policy, Duration::from_millis(20))
            .with_clock(clock.clone())
            .execute(&mut task, &mut |_| {})
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap_err().kind_name(), "TimeoutError");
    }
}

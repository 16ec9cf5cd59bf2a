//! Retry and fault policy for failed task executions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::duration_millis;
use crate::model::{QueuedTaskError, QueuedTaskToken};

/// Default number of failures tolerated before a task faults
pub const DEFAULT_FAULT_THRESHOLD: u32 = 5;

/// Backoff configuration for task retries
///
/// Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use taskline::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error kinds that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    /// - payload decoding and missing executors are not retried
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![
                QueuedTaskError::INVALID_PAYLOAD.to_string(),
                QueuedTaskError::EXECUTOR_NOT_FOUND.to_string(),
            ],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            ..Self::exponential()
        }
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error kind
    pub fn with_non_retryable_error(mut self, error_kind: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_kind.into());
        self
    }

    /// Delay before retrying a task that has failed `fault_count` times before
    ///
    /// The first failure (`fault_count == 0`) waits `initial_interval`.
    pub fn delay_for_fault_count(&self, fault_count: u32) -> Duration {
        let exponent = i32::try_from(fault_count).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64()).max(0.0);

        // Apply jitter
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error kind should be retried
    pub fn should_retry(&self, error_kind: &str) -> bool {
        !self.non_retryable_errors.iter().any(|k| k == error_kind)
    }
}

/// Retry delay function: token → delay
pub type RetryDelayFn = Arc<dyn Fn(&QueuedTaskToken) -> Duration + Send + Sync>;

/// Recoverability predicate: (token, error) → recoverable
pub type RecoverabilityFn = Arc<dyn Fn(&QueuedTaskToken, &QueuedTaskError) -> bool + Send + Sync>;

/// Why a task became terminally faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// The recoverability predicate rejected the error
    Unrecoverable,
    /// The task had already failed `fault_threshold` times
    ThresholdReached,
}

/// What happens to a task after a failed execution
#[derive(Debug, Clone, PartialEq)]
pub enum FaultDecision {
    /// Requeue; eligible again at `retry_at`
    Retry {
        retry_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Terminal fault
    Fault { reason: FaultReason },
}

impl FaultDecision {
    /// Whether the error itself was considered recoverable
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FaultDecision::Fault {
                reason: FaultReason::Unrecoverable
            }
        )
    }
}

/// Policy value deciding the fate of failed tasks
///
/// Holds the retry delay function, the recoverability predicate and the
/// fault threshold. [`TaskProcessingOptions::decide`] is pure: it reads the
/// token and returns a decision without touching it.
#[derive(Clone)]
pub struct TaskProcessingOptions {
    retry_delay: RetryDelayFn,
    recoverability: RecoverabilityFn,
    fault_threshold: u32,
}

impl Default for TaskProcessingOptions {
    fn default() -> Self {
        Self::from_retry_policy(RetryPolicy::default())
    }
}

impl fmt::Debug for TaskProcessingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProcessingOptions")
            .field("fault_threshold", &self.fault_threshold)
            .finish_non_exhaustive()
    }
}

impl TaskProcessingOptions {
    /// Build options whose delay and recoverability come from a retry policy
    pub fn from_retry_policy(policy: RetryPolicy) -> Self {
        let policy = Arc::new(policy);
        let delay_policy = Arc::clone(&policy);
        Self {
            retry_delay: Arc::new(move |token| {
                delay_policy.delay_for_fault_count(token.result().fault_count)
            }),
            recoverability: Arc::new(move |_, error| policy.should_retry(&error.kind)),
            fault_threshold: DEFAULT_FAULT_THRESHOLD,
        }
    }

    /// Set the retry delay function
    pub fn with_retry_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueuedTaskToken) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay = Arc::new(f);
        self
    }

    /// Set the recoverability predicate
    pub fn with_recoverability<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueuedTaskToken, &QueuedTaskError) -> bool + Send + Sync + 'static,
    {
        self.recoverability = Arc::new(f);
        self
    }

    /// Set the fault threshold
    pub fn with_fault_threshold(mut self, threshold: u32) -> Self {
        self.fault_threshold = threshold;
        self
    }

    pub fn fault_threshold(&self) -> u32 {
        self.fault_threshold
    }

    pub fn calculate_retry_delay(&self, token: &QueuedTaskToken) -> Duration {
        (self.retry_delay)(token)
    }

    pub fn is_task_error_recoverable(
        &self,
        token: &QueuedTaskToken,
        error: &QueuedTaskError,
    ) -> bool {
        (self.recoverability)(token, error)
    }

    /// Decide what a new failure means for the task behind `token`
    ///
    /// The token still carries the fault count from before this failure.
    /// Unrecoverable errors fault immediately; a task that already failed
    /// `fault_threshold` times faults regardless of the error; anything else
    /// is retried after the calculated delay.
    pub fn decide(
        &self,
        token: &QueuedTaskToken,
        error: &QueuedTaskError,
        now: DateTime<Utc>,
    ) -> FaultDecision {
        if !self.is_task_error_recoverable(token, error) {
            return FaultDecision::Fault {
                reason: FaultReason::Unrecoverable,
            };
        }
        if token.result().fault_count >= self.fault_threshold {
            return FaultDecision::Fault {
                reason: FaultReason::ThresholdReached,
            };
        }

        let delay = self.calculate_retry_delay(token);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        FaultDecision::Retry { retry_at, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        NewTask, QueuedTaskResult, QueuedTaskStatus, TaskExecutionResult,
    };
    use serde_json::json;

    fn token_with_faults(fault_count: u32) -> QueuedTaskToken {
        let now = Utc::now();
        let task = NewTask::new("noop", json!({})).into_queued(now);
        let mut result = QueuedTaskResult::new(&task);
        result.fault_count = fault_count;
        result.mark_processing(now).unwrap();
        QueuedTaskToken::new(task, result, now)
    }

    fn recoverable() -> QueuedTaskError {
        QueuedTaskError::new("io", "connection reset")
    }

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert!(!policy.should_retry(QueuedTaskError::INVALID_PAYLOAD));
    }

    #[test]
    fn test_delay_for_fault_count() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_fault_count(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_fault_count(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_fault_count(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_fault_count(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_fault_count(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for_fault_count(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_fault_count(7), Duration::from_millis(250));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }

    #[test]
    fn test_below_threshold_is_retried_in_future() {
        let options = TaskProcessingOptions::default().with_fault_threshold(3);
        let now = Utc::now();

        let decision = options.decide(&token_with_faults(2), &recoverable(), now);

        match decision {
            FaultDecision::Retry { retry_at, .. } => assert!(retry_at > now),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_at_threshold_faults_regardless_of_recoverability() {
        let options = TaskProcessingOptions::default().with_fault_threshold(3);

        assert_eq!(
            options.decide(&token_with_faults(3), &recoverable(), Utc::now()),
            FaultDecision::Fault {
                reason: FaultReason::ThresholdReached
            }
        );
    }

    #[test]
    fn test_unrecoverable_faults_at_any_count() {
        let options = TaskProcessingOptions::default().with_fault_threshold(3);
        let error = QueuedTaskError::invalid_payload("missing field `to`");

        for faults in [0, 1, 2] {
            assert_eq!(
                options.decide(&token_with_faults(faults), &error, Utc::now()),
                FaultDecision::Fault {
                    reason: FaultReason::Unrecoverable
                }
            );
        }
    }

    #[test]
    fn test_custom_functions_are_used() {
        let options = TaskProcessingOptions::default()
            .with_retry_delay(|token| Duration::from_millis(10 * (token.result().fault_count as u64 + 1)))
            .with_recoverability(|_, error| error.kind != "fatal");

        let token = token_with_faults(1);
        assert_eq!(options.calculate_retry_delay(&token), Duration::from_millis(20));
        assert!(!options.is_task_error_recoverable(&token, &QueuedTaskError::new("fatal", "x")));
        assert!(options.is_task_error_recoverable(&token, &QueuedTaskError::invalid_payload("x")));
    }

    #[test]
    fn test_status_after_applying_threshold_failure() {
        let options = TaskProcessingOptions::default().with_fault_threshold(1);
        let mut token = token_with_faults(1);

        let status = token
            .apply_execution_result(
                &TaskExecutionResult::failed(recoverable(), Duration::ZERO),
                &options,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(status, QueuedTaskStatus::Faulted);
        assert_eq!(token.result().fault_count, 2);
        assert_eq!(token.result().last_error, Some(recoverable()));
        assert!(token.result().retry_at.is_none());
    }
}

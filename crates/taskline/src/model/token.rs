//! In-flight task tokens

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::result::{ModelError, QueuedTaskError, QueuedTaskResult, QueuedTaskStatus};
use super::task::QueuedTask;
use crate::reliability::{FaultDecision, TaskProcessingOptions};

/// Outcome of executing a task payload
#[derive(Debug, Clone, PartialEq)]
pub enum TaskExecutionOutcome {
    Completed,
    Failed(QueuedTaskError),
    Cancelled,
}

/// Outcome plus how long the execution took
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionResult {
    pub outcome: TaskExecutionOutcome,
    pub elapsed: Duration,
}

impl TaskExecutionResult {
    pub fn completed(elapsed: Duration) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Completed,
            elapsed,
        }
    }

    pub fn failed(error: QueuedTaskError, elapsed: Duration) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Failed(error),
            elapsed,
        }
    }

    pub fn cancelled(elapsed: Duration) -> Self {
        Self {
            outcome: TaskExecutionOutcome::Cancelled,
            elapsed,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.elapsed.as_millis()).unwrap_or(i64::MAX)
    }
}

/// The single in-flight handle of a dequeued task
///
/// Owns the immutable task and its mutable result. Tokens are moved, never
/// cloned, from the poller through the buffer to a worker, so at most one
/// holder can update a result at any time.
#[derive(Debug)]
pub struct QueuedTaskToken {
    task: QueuedTask,
    result: QueuedTaskResult,
    dequeued_at: DateTime<Utc>,
}

impl QueuedTaskToken {
    pub fn new(task: QueuedTask, result: QueuedTaskResult, dequeued_at: DateTime<Utc>) -> Self {
        Self {
            task,
            result,
            dequeued_at,
        }
    }

    pub fn task(&self) -> &QueuedTask {
        &self.task
    }

    pub fn result(&self) -> &QueuedTaskResult {
        &self.result
    }

    pub fn dequeued_at(&self) -> DateTime<Utc> {
        self.dequeued_at
    }

    /// False once the result reached a terminal status
    pub fn can_be_updated(&self) -> bool {
        self.result.can_be_updated()
    }

    /// Apply an execution outcome to the result
    ///
    /// Failures go through the fault policy: the task is either requeued with
    /// a retry time or moved to `Faulted`. Returns the resulting status.
    pub fn apply_execution_result(
        &mut self,
        execution: &TaskExecutionResult,
        options: &TaskProcessingOptions,
        now: DateTime<Utc>,
    ) -> Result<QueuedTaskStatus, ModelError> {
        if !self.can_be_updated() {
            return Err(ModelError::TerminalStatus {
                id: self.result.id,
                status: self.result.status,
            });
        }

        let elapsed_ms = execution.elapsed_ms();
        match &execution.outcome {
            TaskExecutionOutcome::Completed => self.result.mark_processed(elapsed_ms, now)?,
            TaskExecutionOutcome::Cancelled => self.result.mark_cancelled(elapsed_ms, now)?,
            TaskExecutionOutcome::Failed(error) => {
                let decision = options.decide(self, error, now);
                self.result
                    .mark_failed(error.clone(), decision.is_recoverable(), elapsed_ms)?;
                match decision {
                    FaultDecision::Retry { retry_at, delay } => {
                        debug!(
                            task_id = %self.task.id,
                            fault_count = self.result.fault_count,
                            delay_ms = delay.as_millis(),
                            "Requeueing failed task"
                        );
                        self.result.requeue(retry_at)?;
                    }
                    FaultDecision::Fault { reason } => {
                        debug!(
                            task_id = %self.task.id,
                            fault_count = self.result.fault_count,
                            ?reason,
                            "Task faulted"
                        );
                        self.result.mark_faulted(now)?;
                    }
                }
            }
        }

        Ok(self.result.status)
    }

    /// Hand the task back to the pending set without counting an attempt
    pub fn release(&mut self) -> Result<(), ModelError> {
        self.result.release()
    }

    pub fn into_parts(self) -> (QueuedTask, QueuedTaskResult) {
        (self.task, self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use serde_json::json;

    fn token() -> QueuedTaskToken {
        let now = Utc::now();
        let task = NewTask::new("noop", json!({})).into_queued(now);
        let mut result = QueuedTaskResult::new(&task);
        result.mark_processing(now).unwrap();
        QueuedTaskToken::new(task, result, now)
    }

    #[test]
    fn test_completed_execution() {
        let mut t = token();
        let status = t
            .apply_execution_result(
                &TaskExecutionResult::completed(Duration::from_millis(40)),
                &TaskProcessingOptions::default(),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(status, QueuedTaskStatus::Processed);
        assert_eq!(t.result().processing_time_ms, 40);
        assert!(!t.can_be_updated());
    }

    #[test]
    fn test_terminal_token_rejects_second_result() {
        let mut t = token();
        let options = TaskProcessingOptions::default();
        t.apply_execution_result(
            &TaskExecutionResult::cancelled(Duration::ZERO),
            &options,
            Utc::now(),
        )
        .unwrap();

        let err = t
            .apply_execution_result(
                &TaskExecutionResult::completed(Duration::ZERO),
                &options,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::TerminalStatus { .. }));
    }

    #[test]
    fn test_failed_execution_is_requeued() {
        let mut t = token();
        let now = Utc::now();
        let status = t
            .apply_execution_result(
                &TaskExecutionResult::failed(QueuedTaskError::new("io", "timeout"), Duration::ZERO),
                &TaskProcessingOptions::default(),
                now,
            )
            .unwrap();

        assert_eq!(status, QueuedTaskStatus::Unprocessed);
        assert_eq!(t.result().fault_count, 1);
        assert!(t.result().retry_at.unwrap() > now);
        assert!(t.result().last_error_recoverable);
    }
}

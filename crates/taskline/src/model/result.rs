//! Task results and their status machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::QueuedTask;

/// Processing status of a task
///
/// ```text
/// Unprocessed ──► Processing ──► Processed
///      ▲              │    └───► Cancelled
///      │              ▼
///      └─────────── Error ─────► Faulted
/// ```
///
/// `Processed`, `Cancelled` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedTaskStatus {
    Unprocessed,
    Processing,
    Processed,
    Error,
    Cancelled,
    Faulted,
}

impl QueuedTaskStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Cancelled | Self::Faulted)
    }

    /// Whether `self → next` is a legal transition
    ///
    /// `Processing → Unprocessed` is the hand-back path used when a claimed
    /// task could not be executed (shutdown) and does not count as a fault.
    pub fn can_transition_to(self, next: QueuedTaskStatus) -> bool {
        use QueuedTaskStatus::*;
        matches!(
            (self, next),
            (Unprocessed, Processing)
                | (Processing, Processed)
                | (Processing, Error)
                | (Processing, Cancelled)
                | (Processing, Unprocessed)
                | (Error, Unprocessed)
                | (Error, Faulted)
        )
    }

    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Faulted => "faulted",
        }
    }

    /// Parse the storage representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unprocessed" => Some(Self::Unprocessed),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            "faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

impl fmt::Display for QueuedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a task execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTaskError {
    /// Machine-readable error kind
    pub kind: String,
    pub message: String,
    /// Error chain or other diagnostic detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl QueuedTaskError {
    /// Payload could not be decoded into the executor's payload type
    pub const INVALID_PAYLOAD: &'static str = "invalid_payload";
    /// No executor is registered for the task type
    pub const EXECUTOR_NOT_FOUND: &'static str = "executor_not_found";
    /// Error converted from an arbitrary error value
    pub const EXECUTION_FAILED: &'static str = "execution_failed";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PAYLOAD, message)
    }

    pub fn executor_not_found(task_type: &str) -> Self {
        Self::new(
            Self::EXECUTOR_NOT_FOUND,
            format!("no executor registered for task type: {task_type}"),
        )
    }
}

impl fmt::Display for QueuedTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for QueuedTaskError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(Self::EXECUTION_FAILED, error.to_string()).with_detail(format!("{error:?}"))
    }
}

/// Model errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The result already reached a terminal status
    #[error("task {id} is in terminal status {status} and can no longer be updated")]
    TerminalStatus { id: Uuid, status: QueuedTaskStatus },

    /// The requested transition is not part of the status machine
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: QueuedTaskStatus,
        to: QueuedTaskStatus,
    },
}

/// Processing result of a task, updated in place across attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTaskResult {
    pub id: Uuid,
    pub task_type: String,
    pub source: String,
    pub priority: i32,
    pub posted_at: DateTime<Utc>,
    pub status: QueuedTaskStatus,
    /// Number of failed attempts; never decreases
    pub fault_count: u32,
    pub last_error: Option<QueuedTaskError>,
    pub last_error_recoverable: bool,
    /// Earliest time the task may be dequeued again
    pub retry_at: Option<DateTime<Utc>>,
    pub first_processing_attempted_at: Option<DateTime<Utc>>,
    pub last_processing_attempted_at: Option<DateTime<Utc>>,
    pub processing_finalized_at: Option<DateTime<Utc>>,
    /// Duration of the last attempt
    pub processing_time_ms: i64,
}

impl QueuedTaskResult {
    /// Fresh result for a newly posted task
    pub fn new(task: &QueuedTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            source: task.source.clone(),
            priority: task.priority,
            posted_at: task.posted_at,
            status: QueuedTaskStatus::Unprocessed,
            fault_count: 0,
            last_error: None,
            last_error_recoverable: false,
            retry_at: None,
            first_processing_attempted_at: None,
            last_processing_attempted_at: None,
            processing_finalized_at: None,
            processing_time_ms: 0,
        }
    }

    /// Whether the result may still change
    pub fn can_be_updated(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether the task is eligible for dequeue at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == QueuedTaskStatus::Unprocessed && self.retry_at.map_or(true, |at| at <= now)
    }

    fn transition(&mut self, next: QueuedTaskStatus) -> Result<(), ModelError> {
        if self.status.is_terminal() {
            return Err(ModelError::TerminalStatus {
                id: self.id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Claimed by a poller
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Processing)?;
        self.first_processing_attempted_at.get_or_insert(now);
        self.last_processing_attempted_at = Some(now);
        self.retry_at = None;
        Ok(())
    }

    /// Claimed again after the previous consumer's lease expired
    ///
    /// Status and fault count stay as they are; only the attempt time moves.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        if self.status != QueuedTaskStatus::Processing {
            return Err(ModelError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: QueuedTaskStatus::Processing,
            });
        }
        self.first_processing_attempted_at.get_or_insert(now);
        self.last_processing_attempted_at = Some(now);
        Ok(())
    }

    /// Execution succeeded
    pub fn mark_processed(&mut self, elapsed_ms: i64, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Processed)?;
        self.last_error = None;
        self.last_error_recoverable = false;
        self.processing_time_ms = elapsed_ms;
        self.processing_finalized_at = Some(now);
        Ok(())
    }

    /// Execution was cancelled by the executor
    pub fn mark_cancelled(&mut self, elapsed_ms: i64, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Cancelled)?;
        self.processing_time_ms = elapsed_ms;
        self.processing_finalized_at = Some(now);
        Ok(())
    }

    /// Execution failed; records the error and bumps the fault count
    pub fn mark_failed(
        &mut self,
        error: QueuedTaskError,
        recoverable: bool,
        elapsed_ms: i64,
    ) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Error)?;
        self.fault_count = self.fault_count.saturating_add(1);
        self.last_error = Some(error);
        self.last_error_recoverable = recoverable;
        self.processing_time_ms = elapsed_ms;
        Ok(())
    }

    /// Failed task goes back to the pending set
    pub fn requeue(&mut self, retry_at: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Unprocessed)?;
        self.retry_at = Some(retry_at);
        Ok(())
    }

    /// Failed task becomes terminal
    pub fn mark_faulted(&mut self, now: DateTime<Utc>) -> Result<(), ModelError> {
        self.transition(QueuedTaskStatus::Faulted)?;
        self.retry_at = None;
        self.processing_finalized_at = Some(now);
        Ok(())
    }

    /// Claimed task is handed back without an attempt being counted
    pub fn release(&mut self) -> Result<(), ModelError> {
        if self.status != QueuedTaskStatus::Processing {
            return Err(ModelError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: QueuedTaskStatus::Unprocessed,
            });
        }
        self.transition(QueuedTaskStatus::Unprocessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use chrono::Duration;
    use serde_json::json;

    fn result() -> QueuedTaskResult {
        QueuedTaskResult::new(&NewTask::new("noop", json!({})).into_queued(Utc::now()))
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            QueuedTaskStatus::Unprocessed,
            QueuedTaskStatus::Processing,
            QueuedTaskStatus::Processed,
            QueuedTaskStatus::Error,
            QueuedTaskStatus::Cancelled,
            QueuedTaskStatus::Faulted,
        ] {
            assert_eq!(QueuedTaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QueuedTaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_happy_path() {
        let mut r = result();
        let now = Utc::now();
        r.mark_processing(now).unwrap();
        r.mark_processed(12, now).unwrap();

        assert_eq!(r.status, QueuedTaskStatus::Processed);
        assert_eq!(r.processing_time_ms, 12);
        assert!(!r.can_be_updated());
    }

    #[test]
    fn test_terminal_status_rejects_updates() {
        let mut r = result();
        let now = Utc::now();
        r.mark_processing(now).unwrap();
        r.mark_cancelled(0, now).unwrap();

        let err = r.mark_processing(now).unwrap_err();
        assert!(matches!(err, ModelError::TerminalStatus { .. }));
        assert_eq!(r.status, QueuedTaskStatus::Cancelled);
    }

    #[test]
    fn test_failure_then_requeue() {
        let mut r = result();
        let now = Utc::now();
        r.mark_processing(now).unwrap();
        r.mark_failed(QueuedTaskError::new("io", "boom"), true, 5)
            .unwrap();
        r.requeue(now + Duration::seconds(1)).unwrap();

        assert_eq!(r.status, QueuedTaskStatus::Unprocessed);
        assert_eq!(r.fault_count, 1);
        assert!(!r.is_eligible(now));
        assert!(r.is_eligible(now + Duration::seconds(2)));
        assert_eq!(r.last_error.as_ref().unwrap().kind, "io");
    }

    #[test]
    fn test_invalid_transition() {
        let mut r = result();
        let err = r.mark_processed(0, Utc::now()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidTransition { .. }));
        assert!(r.release().is_err());
    }

    #[test]
    fn test_release_keeps_fault_count() {
        let mut r = result();
        r.fault_count = 2;
        r.mark_processing(Utc::now()).unwrap();
        r.release().unwrap();
        assert_eq!(r.status, QueuedTaskStatus::Unprocessed);
        assert_eq!(r.fault_count, 2);
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: QueuedTaskError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind, QueuedTaskError::EXECUTION_FAILED);
        assert_eq!(err.message, "disk full");
        assert!(err.detail.is_some());
    }
}

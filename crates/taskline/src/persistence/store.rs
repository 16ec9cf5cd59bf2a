//! Task store traits

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    ModelError, NewTask, QueuedTask, QueuedTaskResult, QueuedTaskStatus, QueuedTaskToken,
};

/// How long a claim holds before another consumer may take the task over
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The write would violate the status machine
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Only infrastructure failures are transient; missing tasks and status
    /// violations fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Posting side of the queue
#[async_trait]
pub trait TaskQueueProducer: Send + Sync + 'static {
    /// Store a new task and notify listeners
    async fn post_task(&self, task: NewTask) -> Result<QueuedTask, StoreError>;
}

/// Claiming side of the queue
#[async_trait]
pub trait TaskQueueConsumer: Send + Sync + 'static {
    /// Atomically claim the next eligible task
    ///
    /// Eligible means unprocessed and either never failed or past its retry
    /// time, or processing under a claim lease that expired because its
    /// consumer went away. Highest priority first, then oldest. A claimed
    /// task is marked processing and leased in the same operation so no other
    /// consumer can claim it while the lease holds.
    ///
    /// Reclaiming after an expired lease does not count as a fault.
    async fn dequeue(&self) -> Result<Option<QueuedTaskToken>, StoreError>;

    /// Return a claimed but unexecuted task to the pending set
    ///
    /// The fault count is left untouched and the claim lease is dropped.
    async fn release(&self, token: QueuedTaskToken) -> Result<(), StoreError>;
}

/// Persistence sink for task results
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Upsert the result keyed by task id
    ///
    /// Fails with [`StoreError::TaskNotFound`] instead of silently ignoring
    /// results for unknown tasks.
    async fn write_result(&self, result: &QueuedTaskResult) -> Result<(), StoreError>;
}

/// Read access to stored results
#[async_trait]
pub trait TaskQueueInfo: Send + Sync + 'static {
    /// Current result of a task
    async fn task_result(&self, id: Uuid) -> Result<Option<QueuedTaskResult>, StoreError>;

    /// Number of tasks currently in `status`
    async fn count_by_status(&self, status: QueuedTaskStatus) -> Result<u64, StoreError>;
}

/// Everything the pipeline needs from a store
pub trait TaskStore: TaskQueueProducer + TaskQueueConsumer + ResultSink + TaskQueueInfo {}

impl<T> TaskStore for T where T: TaskQueueProducer + TaskQueueConsumer + ResultSink + TaskQueueInfo {}

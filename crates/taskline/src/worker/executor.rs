//! Task executors and their registry

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::model::{QueuedTaskError, QueuedTaskToken, TaskExecutionOutcome, TaskPayload};

/// Why an execution did not complete
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskExecutionError {
    /// The task failed; the fault policy decides whether it is retried
    #[error("task failed: {0}")]
    Failed(QueuedTaskError),

    /// The executor gave up because cancellation was requested
    #[error("task execution cancelled")]
    Cancelled,
}

impl TaskExecutionError {
    /// Failure with a machine-readable kind
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed(QueuedTaskError::new(kind, message))
    }
}

impl From<QueuedTaskError> for TaskExecutionError {
    fn from(error: QueuedTaskError) -> Self {
        Self::Failed(error)
    }
}

impl From<anyhow::Error> for TaskExecutionError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(error.into())
    }
}

/// Context provided to executors
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub source: String,
    pub priority: i32,
    pub posted_at: DateTime<Utc>,
    /// Failed attempts before this one
    pub fault_count: u32,
    /// Worker running this attempt
    pub worker_id: String,
    cancel: CancellationToken,
}

impl TaskExecutionContext {
    pub fn new(token: &QueuedTaskToken, worker_id: impl Into<String>, cancel: CancellationToken) -> Self {
        let task = token.task();
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            source: task.source.clone(),
            priority: task.priority,
            posted_at: task.posted_at,
            fault_count: token.result().fault_count,
            worker_id: worker_id.into(),
            cancel,
        }
    }

    /// Whether the pool is shutting down and wants the task abandoned
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Executes the payload of one task type
///
/// # Example
///
/// ```ignore
/// use taskline::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl TaskExecutor for SendEmail {
///     type Payload = EmailPayload;
///
///     async fn execute(
///         &self,
///         ctx: &TaskExecutionContext,
///         payload: EmailPayload,
///     ) -> Result<(), TaskExecutionError> {
///         mailer.send(&payload.to).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Payload type; its `TASK_TYPE` selects this executor
    type Payload: TaskPayload;

    async fn execute(
        &self,
        ctx: &TaskExecutionContext,
        payload: Self::Payload,
    ) -> Result<(), TaskExecutionError>;
}

/// Type-erased executor: decodes the payload and runs the execution
type ErasedExecutor =
    Arc<dyn Fn(TaskExecutionContext, Value) -> BoxFuture<'static, TaskExecutionOutcome> + Send + Sync>;

fn to_outcome(result: Result<(), TaskExecutionError>) -> TaskExecutionOutcome {
    match result {
        Ok(()) => TaskExecutionOutcome::Completed,
        Err(TaskExecutionError::Failed(error)) => TaskExecutionOutcome::Failed(error),
        Err(TaskExecutionError::Cancelled) => TaskExecutionOutcome::Cancelled,
    }
}

/// Maps task types to executors
#[derive(Default)]
pub struct TaskExecutorRegistry {
    executors: HashMap<String, ErasedExecutor>,
}

impl TaskExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed executor under its payload's task type
    pub fn register<E: TaskExecutor>(&mut self, executor: E) -> &mut Self {
        let executor = Arc::new(executor);
        let erased: ErasedExecutor = Arc::new(move |ctx, payload| {
            let executor = Arc::clone(&executor);
            Box::pin(async move {
                // Decoded once; executors only ever see typed payloads
                let payload: E::Payload = match serde_json::from_value(payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        return TaskExecutionOutcome::Failed(QueuedTaskError::invalid_payload(
                            e.to_string(),
                        ))
                    }
                };
                to_outcome(executor.execute(&ctx, payload).await)
            })
        });
        self.executors
            .insert(E::Payload::TASK_TYPE.to_string(), erased);
        self
    }

    /// Register a closure working on the raw JSON payload
    pub fn register_fn<F, Fut>(&mut self, task_type: &str, handler: F) -> &mut Self
    where
        F: Fn(TaskExecutionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskExecutionError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedExecutor = Arc::new(move |ctx, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { to_outcome(handler(ctx, payload).await) })
        });
        self.executors.insert(task_type.to_string(), erased);
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }

    /// Run the executor for the context's task type
    ///
    /// Unknown task types and panicking executors become failures instead
    /// of taking the worker down.
    pub async fn execute(&self, ctx: TaskExecutionContext, payload: Value) -> TaskExecutionOutcome {
        let Some(executor) = self.executors.get(&ctx.task_type) else {
            return TaskExecutionOutcome::Failed(QueuedTaskError::executor_not_found(
                &ctx.task_type,
            ));
        };

        let task_id = ctx.task_id;
        match AssertUnwindSafe(executor(ctx, payload)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(%task_id, "Task executor panicked");
                TaskExecutionOutcome::Failed(QueuedTaskError::new(
                    QueuedTaskError::EXECUTION_FAILED,
                    "task executor panicked",
                ))
            }
        }
    }
}

impl fmt::Debug for TaskExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutorRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, QueuedTaskResult};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    impl TaskPayload for Greeting {
        const TASK_TYPE: &'static str = "greeting";
    }

    struct Greeter;

    #[async_trait]
    impl TaskExecutor for Greeter {
        type Payload = Greeting;

        async fn execute(
            &self,
            _ctx: &TaskExecutionContext,
            payload: Greeting,
        ) -> Result<(), TaskExecutionError> {
            if payload.name.is_empty() {
                return Err(TaskExecutionError::failed("empty_name", "name is empty"));
            }
            Ok(())
        }
    }

    fn context(task_type: &str) -> TaskExecutionContext {
        let now = Utc::now();
        let task = NewTask::new(task_type, json!({})).into_queued(now);
        let result = QueuedTaskResult::new(&task);
        let token = QueuedTaskToken::new(task, result, now);
        TaskExecutionContext::new(&token, "worker-test", CancellationToken::new())
    }

    fn registry() -> TaskExecutorRegistry {
        let mut registry = TaskExecutorRegistry::new();
        registry
            .register(Greeter)
            .register_fn("explode", |_, payload: Value| async move {
                if !payload.is_string() {
                    panic!("boom");
                }
                Ok::<(), TaskExecutionError>(())
            });
        registry
    }

    #[tokio::test]
    async fn test_typed_executor_runs() {
        let outcome = registry()
            .execute(context("greeting"), json!({"name": "ada"}))
            .await;
        assert_eq!(outcome, TaskExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_executor_failure_is_reported() {
        let outcome = registry()
            .execute(context("greeting"), json!({"name": ""}))
            .await;
        assert!(matches!(outcome, TaskExecutionOutcome::Failed(e) if e.kind == "empty_name"));
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let outcome = registry()
            .execute(context("greeting"), json!({"nom": 1}))
            .await;
        assert!(matches!(
            outcome,
            TaskExecutionOutcome::Failed(e) if e.kind == QueuedTaskError::INVALID_PAYLOAD
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_type() {
        let outcome = registry().execute(context("unknown"), json!({})).await;
        assert!(matches!(
            outcome,
            TaskExecutionOutcome::Failed(e) if e.kind == QueuedTaskError::EXECUTOR_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_panicking_executor_becomes_failure() {
        let outcome = registry().execute(context("explode"), json!({})).await;
        assert!(matches!(
            outcome,
            TaskExecutionOutcome::Failed(e) if e.kind == QueuedTaskError::EXECUTION_FAILED
        ));
    }

    #[test]
    fn test_anyhow_errors_convert() {
        let err: TaskExecutionError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, TaskExecutionError::Failed(e) if e.message == "disk full"));
    }
}

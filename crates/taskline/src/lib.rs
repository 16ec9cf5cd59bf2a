//! # Taskline
//!
//! A durable, database-backed task queue execution pipeline.
//!
//! ## Features
//!
//! - **Atomic claiming**: tasks are claimed with `FOR UPDATE SKIP LOCKED`, safe under many consumers
//! - **Prompt wake-ups**: `LISTEN`/`NOTIFY` triggers re-polls, with self-healing reconnects
//! - **Backpressure**: a bounded priority buffer sits between the poller and the workers
//! - **Retries**: failed tasks are requeued with exponential backoff until a fault threshold
//! - **Resilient results**: results are written off the worker path and backed up during outages
//! - **Execution stats**: per task type timings are kept in memory and flushed periodically
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  notify   ┌──────────────────────┐
//! │ NotificationListener │ ────────▶ │      TaskPoller      │ ◀── dequeue ── store
//! └──────────────────────┘           └──────────────────────┘
//!                                               │ add
//!                                               ▼
//!                                    ┌──────────────────────┐
//!                                    │      TaskBuffer      │
//!                                    └──────────────────────┘
//!                                               │ take
//!                                               ▼
//!                                    ┌──────────────────────┐
//!                                    │      WorkerPool      │ ── executors
//!                                    └──────────────────────┘
//!                                               │ post
//!                                               ▼
//!                                    ┌──────────────────────┐
//!                                    │     ResultQueue      │ ── write ──▶ store
//!                                    └──────────────────────┘       └─▶ backup
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskline::prelude::*;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Resize {
//!     image: String,
//! }
//!
//! impl TaskPayload for Resize {
//!     const TASK_TYPE: &'static str = "resize";
//! }
//!
//! struct Resizer;
//!
//! #[async_trait]
//! impl TaskExecutor for Resizer {
//!     type Payload = Resize;
//!
//!     async fn execute(
//!         &self,
//!         _ctx: &TaskExecutionContext,
//!         payload: Resize,
//!     ) -> Result<(), TaskExecutionError> {
//!         resize(&payload.image).await?;
//!         Ok(())
//!     }
//! }
//!
//! let store = Arc::new(InMemoryTaskStore::new());
//! let pipeline = TaskPipeline::builder()
//!     .store(store.clone())
//!     .executor(Resizer)
//!     .build()?;
//!
//! pipeline.start().await?;
//! store.post_task(NewTask::from_payload(&Resize { image: "a.png".into() })?).await?;
//! ```

pub mod config;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod performance;
pub mod persistence;
pub mod pipeline;
pub mod reliability;
pub mod results;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, PipelineConfig};
    pub use crate::listener::{InMemoryNotificationSource, PostgresNotificationSource};
    pub use crate::metrics::{AppMetricId, AppMetricsProvider};
    pub use crate::model::{
        NewTask, QueuedTask, QueuedTaskError, QueuedTaskResult, QueuedTaskStatus, TaskPayload,
    };
    pub use crate::performance::{
        ExecutionPerformanceMonitor, ExecutionPerformanceWriter, InMemoryExecutionPerformanceWriter,
        PostgresExecutionPerformanceWriter, TaskExecutionStats,
    };
    pub use crate::persistence::{
        InMemoryTaskStore, PostgresTaskStore, ResultSink, StoreError, TaskQueueConsumer,
        TaskQueueInfo, TaskQueueProducer,
    };
    pub use crate::pipeline::{PipelineError, TaskPipeline};
    pub use crate::reliability::{RetryPolicy, TaskProcessingOptions};
    pub use crate::worker::{
        TaskExecutionContext, TaskExecutionError, TaskExecutor, TaskExecutorRegistry,
    };
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use config::{ConfigError, PipelineConfig};
pub use model::{NewTask, QueuedTask, QueuedTaskError, QueuedTaskResult, QueuedTaskStatus, TaskPayload};
pub use persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError};
pub use pipeline::{PipelineError, TaskPipeline, TaskPipelineBuilder};
pub use reliability::{RetryPolicy, TaskProcessingOptions};
pub use worker::{TaskExecutionContext, TaskExecutionError, TaskExecutor, TaskExecutorRegistry};

/// Serde helper storing a `Duration` as whole milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

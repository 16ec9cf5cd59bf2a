//! Worker pool for task execution
//!
//! Drains the task buffer with a fixed number of workers, runs each payload
//! through the executor registry and posts the outcome to the result queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::buffer::TaskBuffer;
use super::executor::{TaskExecutionContext, TaskExecutorRegistry};
use crate::config::ConfigError;
use crate::duration_millis;
use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};
use crate::model::{QueuedTaskStatus, QueuedTaskToken, TaskExecutionOutcome, TaskExecutionResult};
use crate::performance::{ExecutionPerformanceMonitor, PerformanceMonitorConfig};
use crate::reliability::TaskProcessingOptions;
use crate::results::ResultQueue;

const WORKER_METRICS: &[AppMetricId] = &[
    AppMetricId::WorkerProcessedPayloadCount,
    AppMetricId::WorkerBufferWaitCount,
    AppMetricId::WorkerTotalProcessingTime,
    AppMetricId::WorkerSuccessfulProcessedPayloadCount,
    AppMetricId::WorkerFailedProcessedPayloadCount,
    AppMetricId::WorkerProcessingCancelledPayloadCount,
];

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Number of concurrent workers
    pub worker_count: usize,

    /// How long stop waits for workers to drain the buffer
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_count: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid(
                "worker_pool",
                "worker_count must be greater than zero",
            ));
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::invalid("worker_pool", "worker_id must not be empty"));
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Workers are taking tasks from the buffer
    Running,
    /// Workers finish the buffer, then exit
    Draining,
    /// No workers are running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool for executing queued tasks
///
/// # Example
///
/// ```ignore
/// use taskline::worker::{TaskExecutorRegistry, WorkerPool, WorkerPoolConfig};
///
/// let mut registry = TaskExecutorRegistry::new();
/// registry.register(SendEmail);
///
/// let pool = WorkerPool::new(
///     buffer,
///     Arc::new(registry),
///     result_queue,
///     TaskProcessingOptions::default(),
///     WorkerPoolConfig::new().with_worker_count(8),
/// )
/// .with_performance_monitor(monitor);
///
/// pool.start()?;
///
/// // ... later, after the poller completed adding on the buffer
/// pool.stop().await?;
/// ```
pub struct WorkerPool {
    buffer: Arc<TaskBuffer>,
    registry: Arc<TaskExecutorRegistry>,
    results: Arc<ResultQueue>,
    options: TaskProcessingOptions,
    config: WorkerPoolConfig,
    metrics: Arc<AppMetricsCollection>,
    performance: Arc<ExecutionPerformanceMonitor>,
    shutdown: Mutex<CancellationToken>,
    status: RwLock<WorkerPoolStatus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        buffer: Arc<TaskBuffer>,
        registry: Arc<TaskExecutorRegistry>,
        results: Arc<ResultQueue>,
        options: TaskProcessingOptions,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            buffer,
            registry,
            results,
            options,
            config,
            metrics: Arc::new(AppMetricsCollection::new(WORKER_METRICS)),
            performance: Arc::new(ExecutionPerformanceMonitor::new(
                PerformanceMonitorConfig::default(),
            )),
            shutdown: Mutex::new(CancellationToken::new()),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Report execution times to `monitor` instead of a private one
    pub fn with_performance_monitor(mut self, monitor: Arc<ExecutionPerformanceMonitor>) -> Self {
        self.performance = monitor;
        self
    }

    /// Execution statistics per task type
    pub fn performance(&self) -> &Arc<ExecutionPerformanceMonitor> {
        &self.performance
    }

    /// Spawn the workers
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut status = self.status.write();
        if *status != WorkerPoolStatus::Stopped {
            return Err(WorkerPoolError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();

        let mut handles = self.handles.lock();
        for index in 0..self.config.worker_count {
            let worker = Worker {
                worker_id: format!("{}-{}", self.config.worker_id, index),
                buffer: Arc::clone(&self.buffer),
                registry: Arc::clone(&self.registry),
                results: Arc::clone(&self.results),
                options: self.options.clone(),
                metrics: Arc::clone(&self.metrics),
                performance: Arc::clone(&self.performance),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        *status = WorkerPoolStatus::Running;

        info!(
            worker_id = %self.config.worker_id,
            worker_count = self.config.worker_count,
            task_types = ?self.registry.task_types(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Wait for the workers to drain the buffer
    ///
    /// Workers exit once the buffer is completed and empty. Past the shutdown
    /// timeout, running executions are abandoned whether or not the executor
    /// observes its context; their tasks are released back to the store and
    /// `ShutdownTimeout` is returned.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn stop(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Draining worker pool");
        let handles = std::mem::take(&mut *self.handles.lock());
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut timed_out = false;

        loop {
            if handles.iter().all(|h| h.is_finished()) {
                debug!("All workers finished");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let remaining = handles.iter().filter(|h| !h.is_finished()).count();
                warn!(remaining_workers = remaining, "Shutdown timeout reached, cancelling executions");
                self.shutdown.lock().cancel();
                timed_out = true;
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");

        if timed_out {
            Err(WorkerPoolError::ShutdownTimeout)
        } else {
            Ok(())
        }
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }
}

impl AppMetricsProvider for WorkerPool {
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot> {
        self.metrics.collect_metrics()
    }

    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError> {
        self.metrics.query_metric(id)
    }

    fn exported_metric_ids(&self) -> Vec<AppMetricId> {
        self.metrics.exported_metric_ids()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    worker_id: String,
    buffer: Arc<TaskBuffer>,
    registry: Arc<TaskExecutorRegistry>,
    results: Arc<ResultQueue>,
    options: TaskProcessingOptions,
    metrics: Arc<AppMetricsCollection>,
    performance: Arc<ExecutionPerformanceMonitor>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            // Past the shutdown timeout, leftovers are released by the host
            if self.shutdown.is_cancelled() {
                break;
            }

            let token = match self.buffer.try_get_next_task() {
                Some(token) => token,
                None => {
                    self.metrics.bump(AppMetricId::WorkerBufferWaitCount);
                    match self.buffer.next_task(&self.shutdown).await {
                        Some(token) => token,
                        None => break,
                    }
                }
            };
            self.process(token).await;
        }
        debug!(worker_id = %self.worker_id, "Worker exited");
    }

    async fn process(&self, mut token: QueuedTaskToken) {
        let task_id = token.task().id;
        let ctx = TaskExecutionContext::new(&token, &self.worker_id, self.shutdown.clone());
        let payload = token.task().payload.clone();

        let started = Instant::now();
        // An executor ignoring its context must not hold up shutdown
        let (outcome, abandoned) = tokio::select! {
            biased;
            outcome = self.registry.execute(ctx, payload) => (outcome, false),
            _ = self.shutdown.cancelled() => {
                warn!(%task_id, worker_id = %self.worker_id, "Abandoning execution past the shutdown timeout");
                (TaskExecutionOutcome::Cancelled, true)
            }
        };
        let elapsed = started.elapsed();
        let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        self.metrics.bump(AppMetricId::WorkerProcessedPayloadCount);
        self.metrics
            .observe(AppMetricId::WorkerTotalProcessingTime, elapsed_ms);

        let outcome_metric = match &outcome {
            TaskExecutionOutcome::Completed => AppMetricId::WorkerSuccessfulProcessedPayloadCount,
            TaskExecutionOutcome::Failed(_) => AppMetricId::WorkerFailedProcessedPayloadCount,
            TaskExecutionOutcome::Cancelled => AppMetricId::WorkerProcessingCancelledPayloadCount,
        };
        self.metrics.bump(outcome_metric);

        if !abandoned {
            self.performance.report(&token.task().task_type, elapsed_ms);
        }

        // Abandoned because of shutdown: hand the task back untouched
        if outcome == TaskExecutionOutcome::Cancelled && self.shutdown.is_cancelled() {
            debug!(%task_id, "Releasing task cancelled by shutdown");
            self.hand_back(token);
            return;
        }

        let execution = TaskExecutionResult { outcome, elapsed };
        match token.apply_execution_result(&execution, &self.options, Utc::now()) {
            Ok(status) => {
                debug!(%task_id, %status, elapsed_ms, "Task processed");
                self.post(token);
            }
            Err(e) => {
                error!(%task_id, error = %e, "Failed to apply execution result, releasing task");
                self.hand_back(token);
            }
        }
    }

    /// Return a claimed task to the pending set without counting an attempt
    fn hand_back(&self, mut token: QueuedTaskToken) {
        if token.result().status == QueuedTaskStatus::Processing {
            if let Err(e) = token.release() {
                error!(task_id = %token.task().id, error = %e, "Failed to release task");
            }
        }
        self.post(token);
    }

    fn post(&self, token: QueuedTaskToken) {
        let (task, result) = token.into_parts();
        if let Err(e) = self.results.post_result(result) {
            error!(task_id = %task.id, error = %e, "Failed to post task result");
        }
    }
}

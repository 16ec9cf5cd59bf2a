//! Task pipeline host
//!
//! Wires every component together and owns their lifecycle.
//!
//! ```text
//!   start:  result queue ─▶ stats flusher ─▶ listener ─▶ workers ─▶ poller
//!   stop:   poller ─▶ listener ─▶ workers (drain) ─▶ stats flusher ─▶ release leftovers ─▶ result queue
//! ```
//!
//! The result queue starts first and stops last so every result produced
//! while the other components run has somewhere to go.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::listener::{ListenerError, NotificationListener, NotificationSource};
use crate::metrics::{
    join_collect_metrics, join_exported_metric_ids, join_query_metric, AppMetricId,
    AppMetricSnapshot, AppMetricsProvider, MetricsError,
};
use crate::performance::{ExecutionPerformanceMonitor, ExecutionPerformanceWriter};
use crate::persistence::{ResultSink, TaskQueueConsumer};
use crate::reliability::TaskProcessingOptions;
use crate::results::{
    FileResultQueueBackup, InMemoryResultQueueBackup, ResultQueue, ResultQueueBackup,
    ResultQueueError,
};
use crate::worker::{
    BufferError, BufferSynchronizationPolicy, PollerError, TaskBuffer, TaskExecutionContext,
    TaskExecutionError, TaskExecutor, TaskExecutorRegistry, TaskPoller,
    WorkerPool, WorkerPoolError,
};

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No store was given to the builder
    #[error("pipeline has no task store")]
    MissingStore,

    /// A pipeline runs once; build a new one to start again
    #[error("pipeline was already started")]
    AlreadyStarted,

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Worker(#[from] WorkerPoolError),

    #[error(transparent)]
    ResultQueue(#[from] ResultQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Builder for [`TaskPipeline`]
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(PostgresTaskStore::new(pool.clone()));
///
/// let pipeline = TaskPipeline::builder()
///     .store(store)
///     .notifications(Arc::new(PostgresNotificationSource::new(pool)))
///     .executor(SendEmail)
///     .config(PipelineConfig::from_env()?)
///     .build()?;
///
/// pipeline.start().await?;
/// ```
pub struct TaskPipelineBuilder {
    consumer: Option<Arc<dyn TaskQueueConsumer>>,
    sink: Option<Arc<dyn ResultSink>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    registry: TaskExecutorRegistry,
    options: TaskProcessingOptions,
    backup: Option<Arc<dyn ResultQueueBackup>>,
    performance_writer: Option<Arc<dyn ExecutionPerformanceWriter>>,
    config: PipelineConfig,
}

impl TaskPipelineBuilder {
    fn new() -> Self {
        Self {
            consumer: None,
            sink: None,
            notifications: None,
            registry: TaskExecutorRegistry::new(),
            options: TaskProcessingOptions::default(),
            backup: None,
            performance_writer: None,
            config: PipelineConfig::default(),
        }
    }

    /// Claim tasks from and write results to `store`
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TaskQueueConsumer + ResultSink,
    {
        self.consumer = Some(store.clone());
        self.sink = Some(store);
        self
    }

    /// Claim tasks from `consumer`
    pub fn consumer(mut self, consumer: Arc<dyn TaskQueueConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Write results to `sink`
    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Re-poll on new-task notifications; without a source the poller only
    /// wakes on its idle timeout
    pub fn notifications(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(source);
        self
    }

    /// Register a typed executor
    pub fn executor<E: TaskExecutor>(mut self, executor: E) -> Self {
        self.registry.register(executor);
        self
    }

    /// Register a closure for a task type
    pub fn executor_fn<F, Fut>(mut self, task_type: &str, handler: F) -> Self
    where
        F: Fn(TaskExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), TaskExecutionError>> + Send + 'static,
    {
        self.registry.register_fn(task_type, handler);
        self
    }

    /// Replace the executor registry
    pub fn registry(mut self, registry: TaskExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Retry delay, recoverability and fault threshold
    pub fn processing_options(mut self, options: TaskProcessingOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `backup` instead of the one derived from the configuration
    pub fn result_backup(mut self, backup: Arc<dyn ResultQueueBackup>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Flush execution stats to `writer`; kept in memory only otherwise
    pub fn performance_writer(mut self, writer: Arc<dyn ExecutionPerformanceWriter>) -> Self {
        self.performance_writer = Some(writer);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and assemble the components
    pub fn build(self) -> Result<TaskPipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let consumer = self.consumer.ok_or(PipelineError::MissingStore)?;
        let sink = self.sink.ok_or(PipelineError::MissingStore)?;

        let options = match config.fault_threshold {
            Some(threshold) => self.options.with_fault_threshold(threshold),
            None => self.options,
        };

        let backup: Arc<dyn ResultQueueBackup> = match (self.backup, &config.result_backup_dir) {
            (Some(backup), _) => backup,
            (None, Some(dir)) => Arc::new(FileResultQueueBackup::new(dir.clone())),
            (None, None) => Arc::new(InMemoryResultQueueBackup::new()),
        };

        let buffer = Arc::new(TaskBuffer::new(config.buffer_capacity)?);
        let policy = Arc::new(BufferSynchronizationPolicy::new(
            Arc::clone(&buffer),
            config.poller.idle_wait_timeout,
        ));

        let results = Arc::new(ResultQueue::new(sink, backup, config.result_queue.clone()));
        let listener = self
            .notifications
            .map(|source| Arc::new(NotificationListener::new(source, config.listener.clone())));
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&consumer),
            Arc::clone(&buffer),
            policy.clone(),
            config.poller.clone(),
        ));
        let mut performance = ExecutionPerformanceMonitor::new(config.performance.clone());
        if let Some(writer) = self.performance_writer {
            performance = performance.with_writer(writer);
        }
        let performance = Arc::new(performance);
        let workers = Arc::new(
            WorkerPool::new(
                Arc::clone(&buffer),
                Arc::new(self.registry),
                Arc::clone(&results),
                options,
                config.worker.clone(),
            )
            .with_performance_monitor(Arc::clone(&performance)),
        );

        Ok(TaskPipeline {
            consumer,
            buffer,
            policy,
            listener,
            poller,
            workers,
            performance,
            results,
            metrics_log_interval: config.metrics_log_interval,
            state: Mutex::new(PipelineState::Created),
            metrics_logger: Mutex::new(None),
        })
    }
}

/// A running task queue consumer
///
/// Claims tasks from the store, runs them through the registered executors
/// and persists their results.
pub struct TaskPipeline {
    consumer: Arc<dyn TaskQueueConsumer>,
    buffer: Arc<TaskBuffer>,
    policy: Arc<BufferSynchronizationPolicy>,
    listener: Option<Arc<NotificationListener>>,
    poller: Arc<TaskPoller>,
    workers: Arc<WorkerPool>,
    performance: Arc<ExecutionPerformanceMonitor>,
    results: Arc<ResultQueue>,
    metrics_log_interval: Option<Duration>,
    state: Mutex<PipelineState>,
    metrics_logger: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskPipeline {
    pub fn builder() -> TaskPipelineBuilder {
        TaskPipelineBuilder::new()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == PipelineState::Running
    }

    /// Start every component
    ///
    /// If a component fails to start, the ones already running are stopped
    /// again and the error is returned.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Created {
                return Err(PipelineError::AlreadyStarted);
            }
            *state = PipelineState::Running;
        }

        if let Err(e) = self.start_components().await {
            error!(error = %e, "Pipeline failed to start, shutting down");
            self.shutdown().await;
            *self.state.lock() = PipelineState::Stopped;
            return Err(e);
        }

        if let Some(interval) = self.metrics_log_interval {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(log_metrics(self.providers(), interval, cancel.clone()));
            *self.metrics_logger.lock() = Some((cancel, handle));
        }

        info!(
            buffer_capacity = self.buffer.capacity(),
            listener = self.listener.is_some(),
            "Task pipeline started"
        );
        Ok(())
    }

    async fn start_components(&self) -> Result<(), PipelineError> {
        self.results.start().await?;
        self.performance.start();

        let events = match &self.listener {
            Some(listener) => {
                listener.start().await?;
                Some(listener.subscribe())
            }
            None => None,
        };

        self.workers.start()?;
        self.poller.start(events)?;
        Ok(())
    }

    /// Stop every component; idempotent
    ///
    /// Returns [`WorkerPoolError::ShutdownTimeout`] when workers had to be
    /// cancelled. Every component is stopped either way.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Running {
                return Ok(());
            }
            *state = PipelineState::Stopping;
        }

        let result = self.shutdown().await;

        let logger = self.metrics_logger.lock().take();
        if let Some((cancel, handle)) = logger {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "Metrics logger task failed");
            }
        }

        *self.state.lock() = PipelineState::Stopped;
        info!("Task pipeline stopped");
        result
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.poller.stop().await;
        // Buffer is complete from here on; workers exit once it is empty
        self.buffer.complete_adding();

        if let Some(listener) = &self.listener {
            listener.stop().await;
        }

        let drained = self.workers.stop().await;
        if let Err(e) = &drained {
            warn!(error = %e, "Workers did not drain the buffer in time");
        }
        self.performance.stop().await;

        self.release_buffered_tasks().await;
        self.results.stop().await;

        drained.map_err(PipelineError::from)
    }

    /// Execution statistics per task type
    pub fn performance(&self) -> &Arc<ExecutionPerformanceMonitor> {
        &self.performance
    }

    /// Hand tokens nobody executed back to the store
    async fn release_buffered_tasks(&self) {
        let mut released = 0usize;
        while let Some(token) = self.buffer.try_get_next_task() {
            let task_id = token.task().id;
            match self.consumer.release(token).await {
                Ok(()) => released += 1,
                Err(e) => error!(%task_id, error = %e, "Failed to release buffered task"),
            }
        }
        if released > 0 {
            info!(released, "Released unprocessed buffered tasks");
        }
    }

    fn providers(&self) -> Vec<Arc<dyn AppMetricsProvider>> {
        let mut providers: Vec<Arc<dyn AppMetricsProvider>> = vec![
            self.buffer.clone(),
            self.policy.clone(),
            self.poller.clone(),
            self.workers.clone(),
            self.results.clone(),
        ];
        if let Some(listener) = &self.listener {
            providers.push(listener.clone());
        }
        providers
    }
}

impl AppMetricsProvider for TaskPipeline {
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot> {
        let providers = self.providers();
        join_collect_metrics(&as_refs(&providers))
    }

    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError> {
        let providers = self.providers();
        join_query_metric(&as_refs(&providers), id)
    }

    fn exported_metric_ids(&self) -> Vec<AppMetricId> {
        let providers = self.providers();
        join_exported_metric_ids(&as_refs(&providers))
    }
}

fn as_refs(providers: &[Arc<dyn AppMetricsProvider>]) -> Vec<&dyn AppMetricsProvider> {
    providers.iter().map(|p| p.as_ref()).collect()
}

async fn log_metrics(
    providers: Vec<Arc<dyn AppMetricsProvider>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately; nothing worth logging yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = join_collect_metrics(&as_refs(&providers));
                let summary = snapshot
                    .iter()
                    .filter(|m| m.has_observations())
                    .map(|m| format!("{}={}", m.id, m.value))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(metrics = %summary, "Pipeline metrics");
            }
        }
    }
}

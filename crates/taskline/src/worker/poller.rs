//! Task polling
//!
//! Moves tasks from the store into the buffer under control of the
//! synchronization policy. Store errors back off exponentially; empty
//! dequeues wait for a listener signal or the idle timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::buffer::{TaskBuffer, TryAddError};
use super::sync_policy::{ClearForDequeueReason, TaskPollerSynchronizationPolicy};
use crate::config::ConfigError;
use crate::duration_millis;
use crate::listener::ListenerEvent;
use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};
use crate::model::QueuedTaskToken;
use crate::persistence::TaskQueueConsumer;

const POLLER_METRICS: &[AppMetricId] = &[
    AppMetricId::PollerDequeueCount,
    AppMetricId::PollerReturnedTaskCount,
    AppMetricId::QueueConsumerDequeueCount,
    AppMetricId::QueueConsumerTotalDequeueDuration,
    AppMetricId::QueueConsumerMinimumDequeueDuration,
    AppMetricId::QueueConsumerMaximumDequeueDuration,
];

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Initial delay after a failed dequeue
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum delay between failed dequeues
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier for consecutive dequeue failures
    pub backoff_multiplier: f64,

    /// Longest wait after an empty dequeue when no signal arrives
    #[serde(with = "duration_millis")]
    pub idle_wait_timeout: Duration,

    /// Pause before retrying an add that lost the race for the last slot
    #[serde(with = "duration_millis")]
    pub buffer_add_retry_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            idle_wait_timeout: Duration::from_secs(5),
            buffer_add_retry_delay: Duration::from_millis(10),
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum error backoff
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum error backoff
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the idle wait timeout
    pub fn with_idle_wait_timeout(mut self, timeout: Duration) -> Self {
        self.idle_wait_timeout = timeout;
        self
    }

    /// Set the buffer add retry delay
    pub fn with_buffer_add_retry_delay(mut self, delay: Duration) -> Self {
        self.buffer_add_retry_delay = delay;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::invalid(
                "poller",
                "min_interval must not exceed max_interval",
            ));
        }
        if self.idle_wait_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "poller",
                "idle_wait_timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
            .min(self.max_interval)
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Poller already running
    #[error("task poller is already running")]
    AlreadyRunning,
}

/// Single poller feeding the task buffer
///
/// ```text
///   wait_for_clear_to_dequeue ─▶ dequeue ─▶ Some ─▶ wait_for_clear_to_add ─▶ buffer
///              ▲                   │                                          │
///              │                   └── None ─▶ wait_for_dequeue_signal ───────┤
///              └──────────────────────────────────────────────────────────────┘
/// ```
pub struct TaskPoller {
    consumer: Arc<dyn TaskQueueConsumer>,
    buffer: Arc<TaskBuffer>,
    policy: Arc<dyn TaskPollerSynchronizationPolicy>,
    config: PollerConfig,
    metrics: Arc<AppMetricsCollection>,
    cancel: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        consumer: Arc<dyn TaskQueueConsumer>,
        buffer: Arc<TaskBuffer>,
        policy: Arc<dyn TaskPollerSynchronizationPolicy>,
        config: PollerConfig,
    ) -> Self {
        Self {
            consumer,
            buffer,
            policy,
            config,
            metrics: Arc::new(AppMetricsCollection::new(POLLER_METRICS)),
            cancel: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Start polling
    ///
    /// With `events`, every listener event becomes a clear-for-dequeue
    /// signal; without, the poller falls back to the idle wait timeout.
    #[instrument(skip(self, events))]
    pub fn start(
        &self,
        events: Option<broadcast::Receiver<ListenerEvent>>,
    ) -> Result<(), PollerError> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(PollerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.policy.notify_poller_started();

        if let Some(events) = events {
            handles.push(tokio::spawn(relay_listener_events(
                events,
                Arc::clone(&self.policy),
                cancel.clone(),
            )));
        }

        let task = PollerTask {
            consumer: Arc::clone(&self.consumer),
            buffer: Arc::clone(&self.buffer),
            policy: Arc::clone(&self.policy),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            cancel,
        };
        handles.push(tokio::spawn(task.run()));

        info!(buffer_capacity = self.buffer.capacity(), "Task poller started");
        Ok(())
    }

    /// Stop polling and complete adding on the buffer; idempotent
    ///
    /// A task dequeued but not yet buffered is buffered if there is room, or
    /// released back to the store.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        self.policy.notify_poller_stop_requested();

        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Poller task failed");
            }
        }
        info!("Task poller stopped");
    }
}

impl AppMetricsProvider for TaskPoller {
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

async fn relay_listener_events(
    mut events: broadcast::Receiver<ListenerEvent>,
    policy: Arc<dyn TaskPollerSynchronizationPolicy>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };

        let reason = match received {
            Ok(ListenerEvent::NewTaskPosted) => ClearForDequeueReason::NewTaskPostedNotificationReceived,
            Ok(ListenerEvent::Connected | ListenerEvent::ConnectionRestored) => {
                ClearForDequeueReason::NewTaskListenerConnectionStateChange
            }
            Ok(ListenerEvent::TimedOut) => ClearForDequeueReason::ListenerTimedOut,
            // Lagging means notifications were dropped; poll anyway
            Err(broadcast::error::RecvError::Lagged(_)) => {
                ClearForDequeueReason::NewTaskPostedNotificationReceived
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        policy.signal_clear_for_dequeue(reason);
    }
    debug!("Listener event relay exited");
}

// =============================================================================
// Poll loop
// =============================================================================

struct PollerTask {
    consumer: Arc<dyn TaskQueueConsumer>,
    buffer: Arc<TaskBuffer>,
    policy: Arc<dyn TaskPollerSynchronizationPolicy>,
    config: PollerConfig,
    metrics: Arc<AppMetricsCollection>,
    cancel: CancellationToken,
}

impl PollerTask {
    async fn run(self) {
        let mut error_backoff = self.config.min_interval;

        loop {
            if let Err(reason) = self.policy.wait_for_clear_to_dequeue(&self.cancel).await {
                debug!(%reason, "Poll loop: stop before dequeue");
                break;
            }

            // Never cancelled mid-flight: a claim that commits must reach a
            // worker or be released.
            match self.timed_dequeue().await {
                Ok(Some(token)) => {
                    error_backoff = self.config.min_interval;
                    self.metrics.bump(AppMetricId::PollerDequeueCount);
                    trace!(task_id = %token.task().id, "Dequeued task");
                    if !self.push_to_buffer(token).await {
                        break;
                    }
                }
                Ok(None) => {
                    if let Err(reason) = self.policy.wait_for_dequeue_signal(&self.cancel).await {
                        debug!(%reason, "Poll loop: stop while idle");
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = error_backoff.as_millis(),
                        "Dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                    error_backoff = self.config.next_backoff(error_backoff);
                }
            }
        }

        self.policy.notify_poller_stop_requested();
        self.buffer.complete_adding();
        debug!("Poll loop exited");
    }

    async fn timed_dequeue(
        &self,
    ) -> Result<Option<QueuedTaskToken>, crate::persistence::StoreError> {
        let started = Instant::now();
        let dequeued = self.consumer.dequeue().await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        self.metrics.bump(AppMetricId::QueueConsumerDequeueCount);
        self.metrics
            .observe(AppMetricId::QueueConsumerTotalDequeueDuration, elapsed_ms);
        self.metrics
            .observe(AppMetricId::QueueConsumerMinimumDequeueDuration, elapsed_ms);
        self.metrics
            .observe(AppMetricId::QueueConsumerMaximumDequeueDuration, elapsed_ms);
        dequeued
    }

    /// Returns false when the poller must stop
    async fn push_to_buffer(&self, mut token: QueuedTaskToken) -> bool {
        loop {
            if let Err(reason) = self
                .policy
                .wait_for_clear_to_add_to_buffer(&self.cancel)
                .await
            {
                debug!(%reason, task_id = %token.task().id, "Poll loop: stop before buffering");
                self.hand_back(token).await;
                return false;
            }

            match self.buffer.try_add_new_task(token) {
                Ok(()) => return true,
                Err(TryAddError::Full(rejected)) => {
                    token = rejected;
                    trace!(task_id = %token.task().id, "Buffer filled up, retrying add");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.hand_back(token).await;
                            return false;
                        }
                        _ = tokio::time::sleep(self.config.buffer_add_retry_delay) => {}
                    }
                }
                Err(TryAddError::Completed(rejected)) => {
                    self.release(rejected).await;
                    return false;
                }
            }
        }
    }

    /// Buffer the token if there is still room, otherwise release it
    async fn hand_back(&self, token: QueuedTaskToken) {
        if let Err(rejected) = self.buffer.try_add_new_task(token) {
            self.release(rejected.into_token()).await;
        }
    }

    async fn release(&self, token: QueuedTaskToken) {
        let task_id = token.task().id;
        match self.consumer.release(token).await {
            Ok(()) => {
                self.metrics.bump(AppMetricId::PollerReturnedTaskCount);
                debug!(%task_id, "Returned unbuffered task to the store");
            }
            Err(e) => error!(%task_id, error = %e, "Failed to return task to the store"),
        }
    }
}

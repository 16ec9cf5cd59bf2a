//! Poller synchronization policy
//!
//! Decides when the poller may hit the store. The poller blocks while the
//! buffer is full (woken by every take) and, after an empty dequeue, until a
//! clear-for-dequeue signal arrives or the idle wait elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::buffer::TaskBuffer;
use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};

const POLICY_METRICS: &[AppMetricId] = &[
    AppMetricId::PollerWaitForBufferSpaceCount,
    AppMetricId::PollerWaitForDequeueCount,
];

/// Why the poller was told to dequeue again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearForDequeueReason {
    /// The listener received a new-task notification
    NewTaskPostedNotificationReceived,
    /// The listener (re)connected; notifications may have been missed
    NewTaskListenerConnectionStateChange,
    /// The listener waited its full timeout without a notification
    ListenerTimedOut,
}

/// Why a policy wait returned without clearance
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PollerWaitError {
    #[error("wait cancelled")]
    Cancelled,

    #[error("poller stop requested")]
    StopRequested,
}

/// Coordinates the poller with buffer occupancy and dequeue signals
///
/// Exactly one poller calls the wait methods; any task may call
/// [`signal_clear_for_dequeue`](Self::signal_clear_for_dequeue). Waits
/// re-check their condition after every wake-up.
#[async_trait]
pub trait TaskPollerSynchronizationPolicy: AppMetricsProvider + Send + Sync + 'static {
    /// Called when the poller starts; resets wait conditions
    fn notify_poller_started(&self);

    /// Called when the poller is asked to stop; releases every wait
    fn notify_poller_stop_requested(&self);

    /// Signal that a dequeue attempt is worthwhile
    fn signal_clear_for_dequeue(&self, reason: ClearForDequeueReason);

    /// Block until the buffer has room
    async fn wait_for_clear_to_dequeue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError>;

    /// Block until a just-dequeued token may be pushed to the buffer
    async fn wait_for_clear_to_add_to_buffer(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError>;

    /// Block after an empty dequeue until signalled or the idle wait elapses
    async fn wait_for_dequeue_signal(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError>;

    /// Restore the initial, non-signalled state
    fn reset(&self);
}

/// Default policy backed by the buffer's take notifications
pub struct BufferSynchronizationPolicy {
    buffer: Arc<TaskBuffer>,
    idle_wait_timeout: Duration,
    dequeue_signal: Notify,
    stop: Mutex<CancellationToken>,
    metrics: AppMetricsCollection,
}

impl BufferSynchronizationPolicy {
    /// Create a policy for `buffer`
    ///
    /// `idle_wait_timeout` bounds the wait after an empty dequeue so the
    /// store is re-polled even if no signal ever arrives.
    pub fn new(buffer: Arc<TaskBuffer>, idle_wait_timeout: Duration) -> Self {
        Self {
            buffer,
            idle_wait_timeout,
            dequeue_signal: Notify::new(),
            stop: Mutex::new(CancellationToken::new()),
            metrics: AppMetricsCollection::new(POLICY_METRICS),
        }
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().clone()
    }

    async fn wait_for_buffer_space(&self, cancel: &CancellationToken) -> Result<(), PollerWaitError> {
        let stop = self.stop_token();
        loop {
            let retrieved = self.buffer.retrieved();
            tokio::pin!(retrieved);
            retrieved.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(PollerWaitError::Cancelled);
            }
            if stop.is_cancelled() {
                return Err(PollerWaitError::StopRequested);
            }
            if !self.buffer.is_full() {
                return Ok(());
            }

            self.metrics.bump(AppMetricId::PollerWaitForBufferSpaceCount);
            trace!(count = self.buffer.count(), "Buffer full, waiting for space");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollerWaitError::Cancelled),
                _ = stop.cancelled() => return Err(PollerWaitError::StopRequested),
                _ = &mut retrieved => {}
            }
        }
    }
}

#[async_trait]
impl TaskPollerSynchronizationPolicy for BufferSynchronizationPolicy {
    fn notify_poller_started(&self) {
        self.reset();
    }

    fn notify_poller_stop_requested(&self) {
        self.stop.lock().cancel();
    }

    fn signal_clear_for_dequeue(&self, reason: ClearForDequeueReason) {
        trace!(?reason, "Clear for dequeue");
        // A stored permit makes a signal that arrives mid-dequeue count
        // for the next wait.
        self.dequeue_signal.notify_one();
    }

    async fn wait_for_clear_to_dequeue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError> {
        self.wait_for_buffer_space(cancel).await
    }

    async fn wait_for_clear_to_add_to_buffer(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError> {
        self.wait_for_buffer_space(cancel).await
    }

    async fn wait_for_dequeue_signal(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), PollerWaitError> {
        let stop = self.stop_token();
        if cancel.is_cancelled() {
            return Err(PollerWaitError::Cancelled);
        }
        if stop.is_cancelled() {
            return Err(PollerWaitError::StopRequested);
        }

        self.metrics.bump(AppMetricId::PollerWaitForDequeueCount);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PollerWaitError::Cancelled),
            _ = stop.cancelled() => Err(PollerWaitError::StopRequested),
            _ = self.dequeue_signal.notified() => Ok(()),
            _ = tokio::time::sleep(self.idle_wait_timeout) => Ok(()),
        }
    }

    fn reset(&self) {
        // Drain a stored signal, if any
        let _ = self.dequeue_signal.notified().now_or_never();
        *self.stop.lock() = CancellationToken::new();
    }
}

impl AppMetricsProvider for BufferSynchronizationPolicy {
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

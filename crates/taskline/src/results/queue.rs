//! Asynchronous result persistence
//!
//! Workers post results without waiting for the store. A single writer task
//! persists them in arrival order, spills failed writes to the backup and
//! replays the backup on a timer. Results the backup rejects too are held in
//! memory and retried on the same timer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backup::{BackupError, ResultQueueBackup};
use crate::config::ConfigError;
use crate::duration_millis;
use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};
use crate::model::QueuedTaskResult;
use crate::persistence::{ResultSink, StoreError};

const RESULT_QUEUE_METRICS: &[AppMetricId] = &[
    AppMetricId::ResultQueueResultPostCount,
    AppMetricId::ResultQueueResultWritesCount,
    AppMetricId::ResultQueueMinimumResultWriteDuration,
    AppMetricId::ResultQueueMaximumResultWriteDuration,
    AppMetricId::ResultQueueTotalResultWriteDuration,
    AppMetricId::ResultQueueResultWriteRequestTimeoutCount,
];

/// Result queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultQueueConfig {
    /// Results drained from the channel per writer iteration
    pub batch_size: usize,

    /// Longest a single sink write may take before it counts as failed
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,

    /// How often backed-up results are replayed
    #[serde(with = "duration_millis")]
    pub reconciliation_interval: Duration,
}

impl Default for ResultQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            write_timeout: Duration::from_secs(5),
            reconciliation_interval: Duration::from_secs(10),
        }
    }
}

impl ResultQueueConfig {
    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the reconciliation interval
    pub fn with_reconciliation_interval(mut self, interval: Duration) -> Self {
        self.reconciliation_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(
                "result_queue",
                "batch_size must be greater than zero",
            ));
        }
        if self.write_timeout.is_zero() || self.reconciliation_interval.is_zero() {
            return Err(ConfigError::invalid(
                "result_queue",
                "write_timeout and reconciliation_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Result queue errors
#[derive(Debug, thiserror::Error)]
pub enum ResultQueueError {
    #[error("result queue is already running")]
    AlreadyRunning,

    #[error("result queue is not running")]
    NotRunning,

    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Persists task results off the worker path
///
/// ```text
///   post_result ──▶ channel ──▶ writer ──ok──────────────▶ sink
///                                 │
///                                 └──fail/timeout──▶ backup
///                                                      │
///                    reconciliation tick ◀─────────────┘
/// ```
///
/// Every sink write happens on the writer task, so results for the same
/// task are persisted in the order they were posted.
pub struct ResultQueue {
    sink: Arc<dyn ResultSink>,
    backup: Arc<dyn ResultQueueBackup>,
    config: ResultQueueConfig,
    metrics: Arc<AppMetricsCollection>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedTaskResult>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResultQueue {
    pub fn new(
        sink: Arc<dyn ResultSink>,
        backup: Arc<dyn ResultQueueBackup>,
        config: ResultQueueConfig,
    ) -> Self {
        Self {
            sink,
            backup,
            config,
            metrics: Arc::new(AppMetricsCollection::new(RESULT_QUEUE_METRICS)),
            sender: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Initialize the backup and start the writer
    ///
    /// The writer replays the backup immediately, picking up results left
    /// over by a previous process.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ResultQueueError> {
        if self.handle.lock().is_some() {
            return Err(ResultQueueError::AlreadyRunning);
        }

        self.backup.init().await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = ResultWriter {
            sink: Arc::clone(&self.sink),
            backup: Arc::clone(&self.backup),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            backed_up: HashSet::new(),
            pending: HashMap::new(),
        };

        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(ResultQueueError::AlreadyRunning);
        }
        *handle = Some(tokio::spawn(writer.run(receiver)));
        *self.sender.lock() = Some(sender);

        info!(batch_size = self.config.batch_size, "Result queue started");
        Ok(())
    }

    /// Accept a result for asynchronous persistence
    pub fn post_result(&self, result: QueuedTaskResult) -> Result<(), ResultQueueError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ResultQueueError::NotRunning)?;
        sender
            .send(result)
            .map_err(|_| ResultQueueError::NotRunning)?;
        self.metrics.bump(AppMetricId::ResultQueueResultPostCount);
        Ok(())
    }

    /// Flush every accepted result, reconcile once more and stop; idempotent
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        // Closing the channel lets the writer drain what is queued
        drop(self.sender.lock().take());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Result writer task failed");
            }
            info!("Result queue stopped");
        }
    }
}

impl AppMetricsProvider for ResultQueue {
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
// Writer
// =============================================================================

enum WriteFailure {
    /// Retrying later may succeed
    Transient(String),
    /// The sink will reject this result every time
    Permanent(StoreError),
}

struct ResultWriter {
    sink: Arc<dyn ResultSink>,
    backup: Arc<dyn ResultQueueBackup>,
    config: ResultQueueConfig,
    metrics: Arc<AppMetricsCollection>,
    /// Ids known to have an entry in the backup
    backed_up: HashSet<Uuid>,
    /// Results neither the sink nor the backup accepted, newest per task
    pending: HashMap<Uuid, QueuedTaskResult>,
}

impl ResultWriter {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<QueuedTaskResult>) {
        let mut reconciliation = tokio::time::interval(self.config.reconciliation_interval);
        reconciliation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(self.config.batch_size);

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let Some(first) = received else { break };
                    batch.push(first);
                    while batch.len() < self.config.batch_size {
                        match receiver.try_recv() {
                            Ok(result) => batch.push(result),
                            Err(_) => break,
                        }
                    }
                    for result in batch.drain(..) {
                        self.persist(result).await;
                    }
                }
                _ = reconciliation.tick() => self.reconcile().await,
            }
        }

        self.reconcile().await;
        if !self.pending.is_empty() {
            error!(
                lost = self.pending.len(),
                "Results could be neither written nor backed up before shutdown"
            );
        }
        debug!("Result writer exited");
    }

    async fn write(&self, result: &QueuedTaskResult) -> Result<(), WriteFailure> {
        let started = Instant::now();
        let written =
            tokio::time::timeout(self.config.write_timeout, self.sink.write_result(result)).await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        self.metrics
            .observe(AppMetricId::ResultQueueTotalResultWriteDuration, elapsed_ms);
        self.metrics
            .observe(AppMetricId::ResultQueueMinimumResultWriteDuration, elapsed_ms);
        self.metrics
            .observe(AppMetricId::ResultQueueMaximumResultWriteDuration, elapsed_ms);

        match written {
            Ok(Ok(())) => {
                self.metrics.bump(AppMetricId::ResultQueueResultWritesCount);
                Ok(())
            }
            Ok(Err(e)) if e.is_transient() => Err(WriteFailure::Transient(e.to_string())),
            Ok(Err(e)) => Err(WriteFailure::Permanent(e)),
            Err(_) => {
                self.metrics
                    .bump(AppMetricId::ResultQueueResultWriteRequestTimeoutCount);
                Err(WriteFailure::Transient(format!(
                    "write timed out after {:?}",
                    self.config.write_timeout
                )))
            }
        }
    }

    async fn persist(&mut self, result: QueuedTaskResult) {
        match self.write(&result).await {
            Ok(()) => {
                // A newer result supersedes whatever the backup holds
                self.pending.remove(&result.id);
                if self.backed_up.contains(&result.id) {
                    self.forget(result.id).await;
                }
            }
            Err(WriteFailure::Transient(reason)) => {
                warn!(task_id = %result.id, %reason, "Result write failed, backing up");
                self.back_up(result).await;
            }
            Err(WriteFailure::Permanent(e)) => {
                error!(task_id = %result.id, error = %e, "Result rejected by the store");
                self.pending.remove(&result.id);
                if self.backed_up.contains(&result.id) {
                    self.forget(result.id).await;
                }
            }
        }
    }

    /// Spill to the backup, or hold in memory when the backup fails as well
    async fn back_up(&mut self, result: QueuedTaskResult) {
        match self.backup.put(&result).await {
            Ok(()) => {
                self.pending.remove(&result.id);
                self.backed_up.insert(result.id);
            }
            Err(e) => {
                error!(task_id = %result.id, error = %e, "Failed to back up result, keeping it in memory");
                self.pending.insert(result.id, result);
            }
        }
    }

    async fn reconcile(&mut self) {
        self.replay_backup().await;
        // Pending results are newer than any backup entry for the same task
        self.retry_pending().await;
    }

    /// Replay backed-up results until the sink fails again
    async fn replay_backup(&mut self) {
        let items = match self.backup.retrieve_backed_up_items().await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Failed to read result backup");
                return;
            }
        };
        if items.is_empty() {
            self.backed_up.clear();
            return;
        }

        let total = items.len();
        let mut restored = 0usize;
        self.backed_up = items.iter().map(|r| r.id).collect();

        for item in items {
            match self.write(&item).await {
                Ok(()) => {
                    restored += 1;
                    self.forget(item.id).await;
                }
                Err(WriteFailure::Permanent(e)) => {
                    error!(task_id = %item.id, error = %e, "Discarding backed-up result");
                    self.forget(item.id).await;
                }
                Err(WriteFailure::Transient(reason)) => {
                    debug!(%reason, "Store still unavailable, postponing reconciliation");
                    break;
                }
            }
        }

        info!(restored, remaining = total - restored, "Reconciled backed-up results");
    }

    /// Write held results, or move them to the backup while the sink is down
    async fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let mut pending: Vec<QueuedTaskResult> =
            std::mem::take(&mut self.pending).into_values().collect();
        pending.sort_by(|a, b| a.posted_at.cmp(&b.posted_at).then(a.id.cmp(&b.id)));

        let mut sink_down = false;
        for result in pending {
            if !sink_down {
                match self.write(&result).await {
                    Ok(()) => {
                        debug!(task_id = %result.id, "Wrote held result");
                        if self.backed_up.contains(&result.id) {
                            self.forget(result.id).await;
                        }
                        continue;
                    }
                    Err(WriteFailure::Permanent(e)) => {
                        error!(task_id = %result.id, error = %e, "Discarding held result");
                        continue;
                    }
                    Err(WriteFailure::Transient(reason)) => {
                        debug!(%reason, "Store still unavailable for held results");
                        sink_down = true;
                    }
                }
            }
            self.back_up(result).await;
        }
    }

    async fn forget(&mut self, id: Uuid) {
        match self.backup.remove(id).await {
            Ok(()) => {
                self.backed_up.remove(&id);
            }
            Err(e) => error!(task_id = %id, error = %e, "Failed to remove backed-up result"),
        }
    }
}

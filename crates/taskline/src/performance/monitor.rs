//! Execution performance monitor
//!
//! Workers report how long each execution took. The monitor keeps running
//! statistics per task type and periodically hands what changed since the
//! previous flush to an [`ExecutionPerformanceWriter`].
//!
//! ```text
//!   worker ──report(type, ms)──▶ stats ──every interval or N reports──▶ writer
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::stats::TaskExecutionStats;
use super::writer::ExecutionPerformanceWriter;
use crate::config::ConfigError;
use crate::duration_millis;
use crate::persistence::StoreError;

/// Performance monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMonitorConfig {
    /// Longest time between two flushes
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,

    /// Reports that trigger a flush before the interval elapses
    pub flush_count_threshold: usize,
}

impl Default for PerformanceMonitorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            flush_count_threshold: 10,
        }
    }
}

impl PerformanceMonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_flush_count_threshold(mut self, threshold: usize) -> Self {
        self.flush_count_threshold = threshold.max(1);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid(
                "performance_monitor",
                "flush_interval must be greater than zero",
            ));
        }
        if self.flush_count_threshold == 0 {
            return Err(ConfigError::invalid(
                "performance_monitor",
                "flush_count_threshold must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StatsTable {
    stats: DashMap<String, TaskExecutionStats>,
    /// What the writer has accepted so far
    last_flushed: Mutex<HashMap<String, TaskExecutionStats>>,
    unflushed_reports: AtomicUsize,
    flush_requested: Notify,
    /// One flush at a time, so no delta is written twice
    flush_lock: tokio::sync::Mutex<()>,
}

impl StatsTable {
    async fn flush(&self, writer: &dyn ExecutionPerformanceWriter) -> Result<usize, StoreError> {
        let _flushing = self.flush_lock.lock().await;
        self.unflushed_reports.store(0, Ordering::SeqCst);

        let current: HashMap<String, TaskExecutionStats> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let deltas: HashMap<String, TaskExecutionStats> = {
            let flushed = self.last_flushed.lock();
            current
                .iter()
                .filter_map(|(task_type, stats)| {
                    stats
                        .since(flushed.get(task_type))
                        .map(|delta| (task_type.clone(), delta))
                })
                .collect()
        };
        if deltas.is_empty() {
            return Ok(0);
        }

        // Nothing is marked flushed unless the writer accepted it
        writer.write(&deltas).await?;
        *self.last_flushed.lock() = current;
        Ok(deltas.len())
    }
}

/// Keeps execution statistics per task type
pub struct ExecutionPerformanceMonitor {
    table: Arc<StatsTable>,
    writer: Option<Arc<dyn ExecutionPerformanceWriter>>,
    config: PerformanceMonitorConfig,
    flusher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ExecutionPerformanceMonitor {
    /// Monitor that only keeps statistics in memory
    pub fn new(config: PerformanceMonitorConfig) -> Self {
        Self {
            table: Arc::new(StatsTable::default()),
            writer: None,
            config,
            flusher: Mutex::new(None),
        }
    }

    /// Flush statistics to `writer` while running
    pub fn with_writer(mut self, writer: Arc<dyn ExecutionPerformanceWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Record one execution of `task_type`
    pub fn report(&self, task_type: &str, elapsed_ms: i64) {
        match self.table.stats.get_mut(task_type) {
            Some(mut stats) => stats.record(elapsed_ms),
            None => {
                self.table
                    .stats
                    .entry(task_type.to_string())
                    .and_modify(|stats| stats.record(elapsed_ms))
                    .or_insert_with(|| TaskExecutionStats::initial(elapsed_ms));
            }
        }

        let reports = self.table.unflushed_reports.fetch_add(1, Ordering::SeqCst) + 1;
        if reports >= self.config.flush_count_threshold {
            self.table.flush_requested.notify_one();
        }
    }

    /// Statistics of `task_type` since the monitor was created
    pub fn execution_stats(&self, task_type: &str) -> Option<TaskExecutionStats> {
        self.table.stats.get(task_type).map(|stats| *stats)
    }

    /// Statistics of every task type seen so far
    pub fn snapshot(&self) -> HashMap<String, TaskExecutionStats> {
        self.table
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Write what changed since the last flush; returns the task types written
    pub async fn flush(&self) -> Result<usize, StoreError> {
        match &self.writer {
            Some(writer) => self.table.flush(writer.as_ref()).await,
            None => Ok(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flusher.lock().is_some()
    }

    /// Start flushing in the background; without a writer this does nothing
    #[instrument(skip(self))]
    pub fn start(&self) {
        let Some(writer) = &self.writer else {
            debug!("No execution stats writer, keeping stats in memory only");
            return;
        };

        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            debug!("Execution stats flusher already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = StatsFlusher {
            table: Arc::clone(&self.table),
            writer: Arc::clone(writer),
            interval: self.config.flush_interval,
        };
        *flusher = Some((cancel.clone(), tokio::spawn(task.run(cancel))));
        info!(
            flush_interval_ms = self.config.flush_interval.as_millis(),
            flush_count_threshold = self.config.flush_count_threshold,
            "Execution performance monitor started"
        );
    }

    /// Stop the background flush and write what is left; idempotent
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let flusher = self.flusher.lock().take();
        let Some((cancel, handle)) = flusher else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Execution stats flusher failed");
        }
        if let Err(e) = self.flush().await {
            error!(error = %e, "Final execution stats flush failed");
        }
        info!("Execution performance monitor stopped");
    }
}

struct StatsFlusher {
    table: Arc<StatsTable>,
    writer: Arc<dyn ExecutionPerformanceWriter>,
    interval: Duration,
}

impl StatsFlusher {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.table.flush_requested.notified() => {}
            }

            match self.table.flush(self.writer.as_ref()).await {
                Ok(0) => {}
                Ok(written) => debug!(task_types = written, "Flushed execution stats"),
                Err(e) => warn!(error = %e, "Failed to flush execution stats, retrying later"),
            }
        }
        debug!("Execution stats flusher exited");
    }
}

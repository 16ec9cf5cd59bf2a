//! Destinations for flushed execution statistics

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::stats::TaskExecutionStats;
use crate::persistence::StoreError;

/// Receives execution statistics accumulated since the previous flush
///
/// Implementations merge each delta into what they already hold for that
/// task type.
#[async_trait]
pub trait ExecutionPerformanceWriter: Send + Sync + 'static {
    async fn write(&self, deltas: &HashMap<String, TaskExecutionStats>) -> Result<(), StoreError>;
}

/// Process-local writer, mostly for tests
#[derive(Default)]
pub struct InMemoryExecutionPerformanceWriter {
    stats: DashMap<String, TaskExecutionStats>,
}

impl InMemoryExecutionPerformanceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated statistics of `task_type`
    pub fn stats(&self, task_type: &str) -> Option<TaskExecutionStats> {
        self.stats.get(task_type).map(|entry| *entry)
    }

    /// Number of task types written so far
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[async_trait]
impl ExecutionPerformanceWriter for InMemoryExecutionPerformanceWriter {
    async fn write(&self, deltas: &HashMap<String, TaskExecutionStats>) -> Result<(), StoreError> {
        for (task_type, delta) in deltas {
            self.stats
                .entry(task_type.clone())
                .or_default()
                .merge(delta);
        }
        Ok(())
    }
}

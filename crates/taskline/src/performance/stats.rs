//! Per task type execution statistics

use serde::{Deserialize, Serialize};

/// Execution time statistics of one task type, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionStats {
    pub execution_count: u64,
    pub last_execution_ms: i64,
    pub average_execution_ms: i64,
    pub fastest_execution_ms: i64,
    pub longest_execution_ms: i64,
    pub total_execution_ms: i64,
}

impl TaskExecutionStats {
    /// Statistics after a single execution
    pub fn initial(elapsed_ms: i64) -> Self {
        Self {
            execution_count: 1,
            last_execution_ms: elapsed_ms,
            average_execution_ms: elapsed_ms,
            fastest_execution_ms: elapsed_ms,
            longest_execution_ms: elapsed_ms,
            total_execution_ms: elapsed_ms,
        }
    }

    /// Account for one more execution
    pub fn record(&mut self, elapsed_ms: i64) {
        self.execution_count += 1;
        self.last_execution_ms = elapsed_ms;
        self.fastest_execution_ms = self.fastest_execution_ms.min(elapsed_ms);
        self.longest_execution_ms = self.longest_execution_ms.max(elapsed_ms);
        self.total_execution_ms = self.total_execution_ms.saturating_add(elapsed_ms);
        self.average_execution_ms = average(self.total_execution_ms, self.execution_count);
    }

    /// Executions recorded since `previous`, or `None` when there are none
    ///
    /// Fastest and longest stay cumulative; they cannot be split by time.
    pub fn since(&self, previous: Option<&Self>) -> Option<Self> {
        let Some(previous) = previous else {
            return (self.execution_count > 0).then_some(*self);
        };
        let execution_count = self.execution_count.checked_sub(previous.execution_count)?;
        if execution_count == 0 {
            return None;
        }

        let total_execution_ms = self.total_execution_ms - previous.total_execution_ms;
        Some(Self {
            execution_count,
            last_execution_ms: self.last_execution_ms,
            average_execution_ms: average(total_execution_ms, execution_count),
            fastest_execution_ms: self.fastest_execution_ms,
            longest_execution_ms: self.longest_execution_ms,
            total_execution_ms,
        })
    }

    /// Fold a delta produced by [`since`](Self::since) into accumulated stats
    pub fn merge(&mut self, delta: &Self) {
        if self.execution_count == 0 {
            *self = *delta;
            return;
        }
        self.execution_count += delta.execution_count;
        self.last_execution_ms = delta.last_execution_ms;
        self.fastest_execution_ms = self.fastest_execution_ms.min(delta.fastest_execution_ms);
        self.longest_execution_ms = self.longest_execution_ms.max(delta.longest_execution_ms);
        self.total_execution_ms = self.total_execution_ms.saturating_add(delta.total_execution_ms);
        self.average_execution_ms = average(self.total_execution_ms, self.execution_count);
    }
}

/// Rounded up, like the stored average
fn average(total_ms: i64, count: u64) -> i64 {
    match i64::try_from(count) {
        Ok(count) if count > 0 => (total_ms + count - 1).div_euclid(count),
        _ => 0,
    }
}

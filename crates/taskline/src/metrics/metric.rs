//! Atomic metric values

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use super::id::{AppMetricId, AppMetricKind};

/// A single metric value updated through atomic operations
///
/// Min and max metrics start at `i64::MAX` / `i64::MIN` and only move
/// towards the extreme observed so far.
#[derive(Debug)]
pub struct AppMetric {
    id: AppMetricId,
    value: AtomicI64,
}

impl AppMetric {
    /// Create a metric at the initial value for its kind
    pub fn new(id: AppMetricId) -> Self {
        Self::with_value(id, id.kind().initial_value())
    }

    /// Create a metric with an explicit starting value
    pub fn with_value(id: AppMetricId, value: i64) -> Self {
        Self {
            id,
            value: AtomicI64::new(value),
        }
    }

    pub fn id(&self) -> AppMetricId {
        self.id
    }

    pub fn kind(&self) -> AppMetricKind {
        self.id.kind()
    }

    /// Current value
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Overwrite the value
    pub fn update(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Add to the value, returning the new value
    pub fn add(&self, amount: i64) -> i64 {
        self.value.fetch_add(amount, Ordering::Relaxed) + amount
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Lower the value to `candidate` if it is smaller
    pub fn track_min(&self, candidate: i64) {
        let mut current = self.value.load(Ordering::Relaxed);
        while candidate < current {
            match self.value.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Raise the value to `candidate` if it is larger
    pub fn track_max(&self, candidate: i64) {
        let mut current = self.value.load(Ordering::Relaxed);
        while candidate > current {
            match self.value.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record an observation according to the metric kind
    pub fn record(&self, observation: i64) {
        match self.kind() {
            AppMetricKind::Counter | AppMetricKind::Sum => {
                self.add(observation);
            }
            AppMetricKind::Min => self.track_min(observation),
            AppMetricKind::Max => self.track_max(observation),
        }
    }

    /// Point-in-time copy of the metric
    pub fn snapshot(&self) -> AppMetricSnapshot {
        AppMetricSnapshot {
            id: self.id,
            value: self.value(),
        }
    }
}

/// Immutable copy of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetricSnapshot {
    pub id: AppMetricId,
    pub value: i64,
}

impl AppMetricSnapshot {
    /// Combine with another snapshot of the same metric
    pub fn join(self, other: AppMetricSnapshot) -> AppMetricSnapshot {
        debug_assert_eq!(self.id, other.id);
        AppMetricSnapshot {
            id: self.id,
            value: self.id.kind().combine(self.value, other.value),
        }
    }

    /// Whether a min/max metric has observed anything yet
    pub fn has_observations(&self) -> bool {
        self.value != self.id.kind().initial_value()
            || matches!(self.id.kind(), AppMetricKind::Counter | AppMetricKind::Sum)
    }
}

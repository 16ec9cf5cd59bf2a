//! Metric collections and providers

use std::collections::BTreeMap;

use tracing::error;

use super::id::AppMetricId;
use super::metric::{AppMetric, AppMetricSnapshot};

/// Metrics errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    /// The collection does not export the requested metric
    #[error("metric not found: {0}")]
    NotFound(AppMetricId),
}

/// Anything that exports metrics
pub trait AppMetricsProvider: Send + Sync {
    /// Snapshot of every exported metric
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot>;

    /// Snapshot of a single metric
    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError>;

    /// Ids of every exported metric
    fn exported_metric_ids(&self) -> Vec<AppMetricId>;
}

/// Fixed set of metrics owned by one component
///
/// The set of ids is decided at construction and never changes, so the
/// map itself needs no lock; every value is an atomic.
#[derive(Debug)]
pub struct AppMetricsCollection {
    metrics: BTreeMap<AppMetricId, AppMetric>,
}

impl AppMetricsCollection {
    /// Create a collection exporting `ids`, each at its initial value
    pub fn new(ids: &[AppMetricId]) -> Self {
        Self {
            metrics: ids.iter().map(|&id| (id, AppMetric::new(id))).collect(),
        }
    }

    /// Create a collection from explicit starting values
    pub fn with_values(values: impl IntoIterator<Item = (AppMetricId, i64)>) -> Self {
        Self {
            metrics: values
                .into_iter()
                .map(|(id, value)| (id, AppMetric::with_value(id, value)))
                .collect(),
        }
    }

    /// Look up a metric
    pub fn metric(&self, id: AppMetricId) -> Result<&AppMetric, MetricsError> {
        self.metrics.get(&id).ok_or(MetricsError::NotFound(id))
    }

    pub fn increment(&self, id: AppMetricId) -> Result<i64, MetricsError> {
        Ok(self.metric(id)?.increment())
    }

    pub fn add(&self, id: AppMetricId, amount: i64) -> Result<i64, MetricsError> {
        Ok(self.metric(id)?.add(amount))
    }

    pub fn update(&self, id: AppMetricId, value: i64) -> Result<(), MetricsError> {
        self.metric(id)?.update(value);
        Ok(())
    }

    pub fn track_min(&self, id: AppMetricId, candidate: i64) -> Result<(), MetricsError> {
        self.metric(id)?.track_min(candidate);
        Ok(())
    }

    pub fn track_max(&self, id: AppMetricId, candidate: i64) -> Result<(), MetricsError> {
        self.metric(id)?.track_max(candidate);
        Ok(())
    }

    /// Record an observation according to the metric kind
    pub fn record(&self, id: AppMetricId, observation: i64) -> Result<(), MetricsError> {
        self.metric(id)?.record(observation);
        Ok(())
    }

    /// Record an observation on a metric the owning component declared itself
    ///
    /// Components build their collection from a constant id list, so a miss
    /// here is a programming error: it asserts in debug builds and is logged
    /// in release builds.
    pub(crate) fn observe(&self, id: AppMetricId, observation: i64) {
        if let Err(e) = self.record(id, observation) {
            debug_assert!(false, "undeclared metric: {e}");
            error!(metric = %id, "Recording undeclared metric");
        }
    }

    /// Shorthand for observing a single event
    pub(crate) fn bump(&self, id: AppMetricId) {
        self.observe(id, 1);
    }
}

impl AppMetricsProvider for AppMetricsCollection {
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot> {
        self.metrics.values().map(AppMetric::snapshot).collect()
    }

    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError> {
        self.metric(id).map(AppMetric::snapshot)
    }

    fn exported_metric_ids(&self) -> Vec<AppMetricId> {
        self.metrics.keys().copied().collect()
    }
}

/// Collect and combine metrics across providers
///
/// Snapshots of the same id are joined according to the metric kind.
pub fn join_collect_metrics(providers: &[&dyn AppMetricsProvider]) -> Vec<AppMetricSnapshot> {
    let mut joined: BTreeMap<AppMetricId, AppMetricSnapshot> = BTreeMap::new();
    for provider in providers {
        for snapshot in provider.collect_metrics() {
            joined
                .entry(snapshot.id)
                .and_modify(|existing| *existing = existing.join(snapshot))
                .or_insert(snapshot);
        }
    }
    joined.into_values().collect()
}

/// Query one metric across providers
///
/// Fails with [`MetricsError::NotFound`] when no provider exports it.
pub fn join_query_metric(
    providers: &[&dyn AppMetricsProvider],
    id: AppMetricId,
) -> Result<AppMetricSnapshot, MetricsError> {
    providers
        .iter()
        .filter_map(|p| p.query_metric(id).ok())
        .reduce(AppMetricSnapshot::join)
        .ok_or(MetricsError::NotFound(id))
}

/// Ids exported by any of the providers
pub fn join_exported_metric_ids(providers: &[&dyn AppMetricsProvider]) -> Vec<AppMetricId> {
    let mut ids: Vec<AppMetricId> = providers
        .iter()
        .flat_map(|p| p.exported_metric_ids())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

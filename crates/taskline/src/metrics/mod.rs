//! Application metrics
//!
//! This module provides:
//! - [`AppMetricId`] - Identifier and aggregation kind of every exported metric
//! - [`AppMetric`] - A single atomically updated value
//! - [`AppMetricsCollection`] - The fixed metric set owned by one component
//! - [`AppMetricsProvider`] - Implemented by every pipeline component
//!
//! Every update is a single atomic operation (add, store, or a
//! compare-and-swap loop for min/max), so components can share their
//! collection across tasks without locks.

mod collection;
mod id;
mod metric;

pub use collection::{
    join_collect_metrics, join_exported_metric_ids, join_query_metric, AppMetricsCollection,
    AppMetricsProvider, MetricsError,
};
pub use id::{AppMetricId, AppMetricKind};
pub use metric::{AppMetric, AppMetricSnapshot};

//! Execution performance tracking
//!
//! This module provides:
//! - [`ExecutionPerformanceMonitor`] - Running execution statistics per task type
//! - [`ExecutionPerformanceWriter`] - Seam the monitor flushes through
//! - [`InMemoryExecutionPerformanceWriter`] and [`PostgresExecutionPerformanceWriter`]

mod monitor;
mod postgres;
mod stats;
mod writer;

pub use monitor::{ExecutionPerformanceMonitor, PerformanceMonitorConfig};
pub use postgres::PostgresExecutionPerformanceWriter;
pub use stats::TaskExecutionStats;
pub use writer::{ExecutionPerformanceWriter, InMemoryExecutionPerformanceWriter};

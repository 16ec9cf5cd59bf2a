//! Result persistence with backup and reconciliation
//!
//! This module provides:
//! - [`ResultQueue`] - Single-writer asynchronous result persistence
//! - [`ResultQueueBackup`] - Fallback store for results the sink rejected
//! - [`InMemoryResultQueueBackup`] and [`FileResultQueueBackup`]

mod backup;
mod queue;

pub use backup::{
    BackupError, FileResultQueueBackup, InMemoryResultQueueBackup, ResultQueueBackup,
};
pub use queue::{ResultQueue, ResultQueueConfig, ResultQueueError};

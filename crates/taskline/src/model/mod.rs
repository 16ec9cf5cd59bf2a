//! Task queue data model
//!
//! This module provides:
//! - [`QueuedTask`] - Immutable task as posted by a producer
//! - [`QueuedTaskResult`] - Mutable processing result, one per task
//! - [`QueuedTaskToken`] - Single-owner in-flight handle combining both
//! - [`QueuedTaskStatus`] - Monotonic status machine

mod result;
mod task;
mod token;

pub use result::{ModelError, QueuedTaskError, QueuedTaskResult, QueuedTaskStatus};
pub use task::{NewTask, QueuedTask, TaskPayload};
pub use token::{QueuedTaskToken, TaskExecutionOutcome, TaskExecutionResult};

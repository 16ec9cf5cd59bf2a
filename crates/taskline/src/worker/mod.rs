//! Task processing workers
//!
//! This module provides:
//! - [`TaskBuffer`] - Bounded priority buffer between the poller and the workers
//! - [`TaskPollerSynchronizationPolicy`] - Decides when the poller may dequeue and add
//! - [`TaskPoller`] - Moves claimed tasks from the store into the buffer
//! - [`WorkerPool`] - Runs buffered tasks through their executors
//! - [`TaskExecutorRegistry`] - Maps task types to executors
//!
//! ```text
//!   store ──dequeue──▶ TaskPoller ──add──▶ TaskBuffer ──take──▶ WorkerPool ──▶ ResultQueue
//!                          ▲                   │
//!                          └──── policy ◀──────┘ (retrieved / space freed)
//! ```

mod buffer;
mod executor;
mod poller;
mod pool;
mod sync_policy;

pub use buffer::{BufferError, TaskBuffer, TryAddError};
pub use executor::{
    TaskExecutionContext, TaskExecutionError, TaskExecutor, TaskExecutorRegistry,
};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use sync_policy::{
    BufferSynchronizationPolicy, ClearForDequeueReason, PollerWaitError,
    TaskPollerSynchronizationPolicy,
};

//! Persistence layer for the task queue
//!
//! This module provides:
//! - [`TaskQueueProducer`], [`TaskQueueConsumer`], [`ResultSink`] and
//!   [`TaskQueueInfo`] - the store seams the pipeline is built on
//! - [`InMemoryTaskStore`] for testing
//! - [`PostgresTaskStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::{PostgresTaskStore, DEFAULT_NOTIFICATION_CHANNEL};
pub use store::{
    ResultSink, DEFAULT_CLAIM_LEASE, StoreError, TaskQueueConsumer, TaskQueueInfo, TaskQueueProducer, TaskStore,
};

//! Reliability patterns for task processing
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter and non-retryable error kinds
//! - [`TaskProcessingOptions`] - Retry delay, recoverability and fault threshold
//! - [`FaultDecision`] - Outcome of the fault policy for a failed task

mod retry;

pub use retry::{
    FaultDecision, FaultReason, RecoverabilityFn, RetryDelayFn, RetryPolicy,
    TaskProcessingOptions, DEFAULT_FAULT_THRESHOLD,
};

//! Queued tasks as posted by producers

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed task payload
///
/// The task type tag is stored next to the JSON payload so the worker pool
/// can pick the executor and decode the payload once.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use taskline::TaskPayload;
///
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl TaskPayload for SendEmail {
///     const TASK_TYPE: &'static str = "send_email";
/// }
/// ```
pub trait TaskPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Type tag used for executor lookup
    const TASK_TYPE: &'static str;
}

/// A task as stored in the queue
///
/// Immutable once posted; workers only ever see it behind a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task_type: String,
    pub source: String,
    /// Higher values are dequeued first
    pub priority: i32,
    pub posted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Definition of a task to be posted
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub source: String,
    pub priority: i32,
    pub payload: serde_json::Value,
}

impl NewTask {
    /// Create a task definition from a raw type tag and payload
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            source: "default".to_string(),
            priority: 0,
            payload,
        }
    }

    /// Create a task definition from a typed payload
    pub fn from_payload<P: TaskPayload>(payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self::new(P::TASK_TYPE, serde_json::to_value(payload)?))
    }

    /// Set the source tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Assign an identity and posting time
    pub fn into_queued(self, posted_at: DateTime<Utc>) -> QueuedTask {
        QueuedTask {
            id: Uuid::now_v7(),
            task_type: self.task_type,
            source: self.source,
            priority: self.priority,
            posted_at,
            payload: self.payload,
        }
    }
}

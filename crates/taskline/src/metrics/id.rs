//! Metric identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// How values reported for a metric are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMetricKind {
    /// Add-only count of events
    Counter,
    /// Accumulated total (typically milliseconds)
    Sum,
    /// Lowest value observed
    Min,
    /// Highest value observed
    Max,
}

impl AppMetricKind {
    /// Value a fresh metric of this kind starts from
    pub fn initial_value(self) -> i64 {
        match self {
            Self::Counter | Self::Sum => 0,
            Self::Min => i64::MAX,
            Self::Max => i64::MIN,
        }
    }

    /// Combine two values of this kind
    pub fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            Self::Counter | Self::Sum => a.saturating_add(b),
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// Identifier of every metric exported by the pipeline
///
/// Each id belongs to one subsystem (its category) and has a declared
/// aggregation kind. The string form is `category@name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMetricId {
    // Notification listener
    ListenerTaskNotificationCount,
    ListenerReconnectCount,
    ListenerNotificationWaitTimeoutCount,

    // Task poller
    PollerDequeueCount,
    PollerWaitForDequeueCount,
    PollerWaitForBufferSpaceCount,
    PollerReturnedTaskCount,

    // Worker pool
    WorkerProcessedPayloadCount,
    WorkerBufferWaitCount,
    WorkerTotalProcessingTime,
    WorkerSuccessfulProcessedPayloadCount,
    WorkerFailedProcessedPayloadCount,
    WorkerProcessingCancelledPayloadCount,

    // Queue consumer (dequeue timings)
    QueueConsumerDequeueCount,
    QueueConsumerTotalDequeueDuration,
    QueueConsumerMinimumDequeueDuration,
    QueueConsumerMaximumDequeueDuration,

    // Result queue
    ResultQueueResultPostCount,
    ResultQueueResultWritesCount,
    ResultQueueMaximumResultWriteDuration,
    ResultQueueMinimumResultWriteDuration,
    ResultQueueTotalResultWriteDuration,
    ResultQueueResultWriteRequestTimeoutCount,

    // Task buffer
    BufferMaxCount,
    BufferMinCount,
    BufferTimesFilled,
    BufferTimesEmptied,
}

impl AppMetricId {
    /// Every known metric id
    pub const ALL: &'static [AppMetricId] = &[
        Self::ListenerTaskNotificationCount,
        Self::ListenerReconnectCount,
        Self::ListenerNotificationWaitTimeoutCount,
        Self::PollerDequeueCount,
        Self::PollerWaitForDequeueCount,
        Self::PollerWaitForBufferSpaceCount,
        Self::PollerReturnedTaskCount,
        Self::WorkerProcessedPayloadCount,
        Self::WorkerBufferWaitCount,
        Self::WorkerTotalProcessingTime,
        Self::WorkerSuccessfulProcessedPayloadCount,
        Self::WorkerFailedProcessedPayloadCount,
        Self::WorkerProcessingCancelledPayloadCount,
        Self::QueueConsumerDequeueCount,
        Self::QueueConsumerTotalDequeueDuration,
        Self::QueueConsumerMinimumDequeueDuration,
        Self::QueueConsumerMaximumDequeueDuration,
        Self::ResultQueueResultPostCount,
        Self::ResultQueueResultWritesCount,
        Self::ResultQueueMaximumResultWriteDuration,
        Self::ResultQueueMinimumResultWriteDuration,
        Self::ResultQueueTotalResultWriteDuration,
        Self::ResultQueueResultWriteRequestTimeoutCount,
        Self::BufferMaxCount,
        Self::BufferMinCount,
        Self::BufferTimesFilled,
        Self::BufferTimesEmptied,
    ];

    /// Subsystem the metric belongs to
    pub fn category(self) -> &'static str {
        match self {
            Self::ListenerTaskNotificationCount
            | Self::ListenerReconnectCount
            | Self::ListenerNotificationWaitTimeoutCount => "listener",
            Self::PollerDequeueCount
            | Self::PollerWaitForDequeueCount
            | Self::PollerWaitForBufferSpaceCount
            | Self::PollerReturnedTaskCount => "poller",
            Self::WorkerProcessedPayloadCount
            | Self::WorkerBufferWaitCount
            | Self::WorkerTotalProcessingTime
            | Self::WorkerSuccessfulProcessedPayloadCount
            | Self::WorkerFailedProcessedPayloadCount
            | Self::WorkerProcessingCancelledPayloadCount => "worker",
            Self::QueueConsumerDequeueCount
            | Self::QueueConsumerTotalDequeueDuration
            | Self::QueueConsumerMinimumDequeueDuration
            | Self::QueueConsumerMaximumDequeueDuration => "queue-consumer",
            Self::ResultQueueResultPostCount
            | Self::ResultQueueResultWritesCount
            | Self::ResultQueueMaximumResultWriteDuration
            | Self::ResultQueueMinimumResultWriteDuration
            | Self::ResultQueueTotalResultWriteDuration
            | Self::ResultQueueResultWriteRequestTimeoutCount => "result-queue",
            Self::BufferMaxCount
            | Self::BufferMinCount
            | Self::BufferTimesFilled
            | Self::BufferTimesEmptied => "task-buffer",
        }
    }

    /// Metric name within its category
    pub fn name(self) -> &'static str {
        match self {
            Self::ListenerTaskNotificationCount => "task-notification-count",
            Self::ListenerReconnectCount => "reconnect-count",
            Self::ListenerNotificationWaitTimeoutCount => "notification-wait-timeout-count",
            Self::PollerDequeueCount => "dequeue-count",
            Self::PollerWaitForDequeueCount => "wait-dequeue-count",
            Self::PollerWaitForBufferSpaceCount => "wait-buffer-space-count",
            Self::PollerReturnedTaskCount => "returned-task-count",
            Self::WorkerProcessedPayloadCount => "processed-payload-count",
            Self::WorkerBufferWaitCount => "buffer-wait-count",
            Self::WorkerTotalProcessingTime => "total-processing-time",
            Self::WorkerSuccessfulProcessedPayloadCount => "successful-processed-payload-count",
            Self::WorkerFailedProcessedPayloadCount => "failed-processed-payload-count",
            Self::WorkerProcessingCancelledPayloadCount => "processing-cancelled-payload-count",
            Self::QueueConsumerDequeueCount => "dequeue-count",
            Self::QueueConsumerTotalDequeueDuration => "total-dequeue-duration",
            Self::QueueConsumerMinimumDequeueDuration => "minimum-dequeue-duration",
            Self::QueueConsumerMaximumDequeueDuration => "maximum-dequeue-duration",
            Self::ResultQueueResultPostCount => "result-post-count",
            Self::ResultQueueResultWritesCount => "result-writes-count",
            Self::ResultQueueMaximumResultWriteDuration => "maximum-result-write-duration",
            Self::ResultQueueMinimumResultWriteDuration => "minimum-result-write-duration",
            Self::ResultQueueTotalResultWriteDuration => "total-result-write-duration",
            Self::ResultQueueResultWriteRequestTimeoutCount => "result-write-rq-timeout-count",
            Self::BufferMaxCount => "max-count",
            Self::BufferMinCount => "min-count",
            Self::BufferTimesFilled => "times-filled",
            Self::BufferTimesEmptied => "times-emptied",
        }
    }

    /// Aggregation kind
    pub fn kind(self) -> AppMetricKind {
        match self {
            Self::WorkerTotalProcessingTime
            | Self::QueueConsumerTotalDequeueDuration
            | Self::ResultQueueTotalResultWriteDuration => AppMetricKind::Sum,
            Self::QueueConsumerMinimumDequeueDuration
            | Self::ResultQueueMinimumResultWriteDuration
            | Self::BufferMinCount => AppMetricKind::Min,
            Self::QueueConsumerMaximumDequeueDuration
            | Self::ResultQueueMaximumResultWriteDuration
            | Self::BufferMaxCount => AppMetricKind::Max,
            _ => AppMetricKind::Counter,
        }
    }
}

impl fmt::Display for AppMetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.category(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display_is_category_at_name() {
        assert_eq!(
            AppMetricId::BufferTimesFilled.to_string(),
            "task-buffer@times-filled"
        );
        assert_eq!(
            AppMetricId::ResultQueueResultWriteRequestTimeoutCount.to_string(),
            "result-queue@result-write-rq-timeout-count"
        );
    }

    #[test]
    fn test_string_forms_are_unique() {
        let names: HashSet<String> = AppMetricId::ALL.iter().map(|id| id.to_string()).collect();
        assert_eq!(names.len(), AppMetricId::ALL.len());
    }

    #[test]
    fn test_kind_combine() {
        assert_eq!(AppMetricKind::Counter.combine(2, 3), 5);
        assert_eq!(AppMetricKind::Min.combine(2, 3), 2);
        assert_eq!(AppMetricKind::Max.combine(2, 3), 3);
        assert_eq!(AppMetricKind::Min.initial_value(), i64::MAX);
    }
}

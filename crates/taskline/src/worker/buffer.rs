//! Bounded hand-off buffer between the poller and the worker pool

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};
use crate::model::QueuedTaskToken;

const BUFFER_METRICS: &[AppMetricId] = &[
    AppMetricId::BufferMaxCount,
    AppMetricId::BufferMinCount,
    AppMetricId::BufferTimesFilled,
    AppMetricId::BufferTimesEmptied,
];

/// Buffer construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("task buffer capacity must be greater than zero")]
    ZeroCapacity,
}

/// Rejected add; hands the token back to the caller
#[derive(Debug, thiserror::Error)]
pub enum TryAddError {
    /// The buffer is at capacity; retry later
    #[error("task buffer is full")]
    Full(QueuedTaskToken),

    /// Adding has been completed; no more tokens are accepted
    #[error("task buffer no longer accepts tasks")]
    Completed(QueuedTaskToken),
}

impl TryAddError {
    /// Recover the rejected token
    pub fn into_token(self) -> QueuedTaskToken {
        match self {
            Self::Full(token) | Self::Completed(token) => token,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Heap entry: higher priority first, then earlier arrival
struct BufferedToken {
    priority: i32,
    seq: u64,
    token: QueuedTaskToken,
}

impl PartialEq for BufferedToken {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for BufferedToken {}

impl PartialOrd for BufferedToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferedToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct BufferState {
    queue: BinaryHeap<BufferedToken>,
    next_seq: u64,
    adding_completed: bool,
}

/// Bounded, thread-safe queue of task tokens
///
/// Adds and takes never block; the poller backs off on a full buffer and
/// workers await [`TaskBuffer::next_task`]. The internal lock only guards the
/// heap and is never held across an await point.
///
/// ```
/// use taskline::worker::TaskBuffer;
///
/// let buffer = TaskBuffer::new(8).unwrap();
/// assert!(buffer.is_empty());
/// buffer.complete_adding();
/// assert!(buffer.is_completed());
/// ```
pub struct TaskBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    task_added: Notify,
    task_retrieved: Notify,
    metrics: AppMetricsCollection,
}

impl TaskBuffer {
    /// Create a buffer holding at most `capacity` tokens
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        Ok(Self {
            capacity,
            state: Mutex::new(BufferState::default()),
            task_added: Notify::new(),
            task_retrieved: Notify::new(),
            metrics: AppMetricsCollection::new(BUFFER_METRICS),
        })
    }

    /// Add a token without blocking
    ///
    /// Fails with the token handed back when the buffer is full or adding
    /// has been completed.
    pub fn try_add_new_task(&self, token: QueuedTaskToken) -> Result<(), TryAddError> {
        let count = {
            let mut state = self.state.lock();
            if state.adding_completed {
                return Err(TryAddError::Completed(token));
            }
            if state.queue.len() >= self.capacity {
                return Err(TryAddError::Full(token));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(BufferedToken {
                priority: token.task().priority,
                seq,
                token,
            });
            state.queue.len()
        };

        self.record_count(count);
        if count == self.capacity {
            self.metrics.bump(AppMetricId::BufferTimesFilled);
        }
        self.task_added.notify_waiters();
        Ok(())
    }

    /// Take the next token without blocking
    pub fn try_get_next_task(&self) -> Option<QueuedTaskToken> {
        let (entry, count) = {
            let mut state = self.state.lock();
            let entry = state.queue.pop()?;
            (entry, state.queue.len())
        };

        self.record_count(count);
        if count == 0 {
            self.metrics.bump(AppMetricId::BufferTimesEmptied);
        }
        self.task_retrieved.notify_waiters();
        Some(entry.token)
    }

    /// Wait for the next token
    ///
    /// Returns `None` once the buffer is completed or `cancel` fires.
    pub async fn next_task(&self, cancel: &CancellationToken) -> Option<QueuedTaskToken> {
        loop {
            let notified = self.task_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.try_get_next_task() {
                return Some(token);
            }
            if self.is_completed() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Mark that no further tokens will be added; idempotent
    pub fn complete_adding(&self) {
        self.state.lock().adding_completed = true;
        self.task_added.notify_waiters();
        self.task_retrieved.notify_waiters();
    }

    /// True once adding is completed and every token has been taken
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock();
        state.adding_completed && state.queue.is_empty()
    }

    pub fn is_adding_completed(&self) -> bool {
        self.state.lock().adding_completed
    }

    pub fn count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Future resolving on the next take or on completion
    ///
    /// Call `enable()` on the pinned future before re-checking the buffer so
    /// a take racing with the check is not missed.
    pub fn retrieved(&self) -> Notified<'_> {
        self.task_retrieved.notified()
    }

    fn record_count(&self, count: usize) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.metrics.observe(AppMetricId::BufferMaxCount, count);
        self.metrics.observe(AppMetricId::BufferMinCount, count);
    }
}

impl AppMetricsProvider for TaskBuffer {
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot> {
        self.metrics.collect_metrics()
    }

    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError> {
        self.metrics.query_metric(id)
    }

    fn exported_metric_ids(&self) -> Vec<AppMetricId> {
        self.metrics.exported_metric_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, QueuedTaskResult};
    use chrono::Utc;
    use rand::Rng;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::time::Duration;

    fn token(priority: i32) -> QueuedTaskToken {
        let now = Utc::now();
        let task = NewTask::new("noop", json!({}))
            .with_priority(priority)
            .into_queued(now);
        let result = QueuedTaskResult::new(&task);
        QueuedTaskToken::new(task, result, now)
    }

    fn metric(buffer: &TaskBuffer, id: AppMetricId) -> i64 {
        buffer.query_metric(id).unwrap().value
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(TaskBuffer::new(0).err(), Some(BufferError::ZeroCapacity));
    }

    #[test]
    fn test_full_buffer_hands_token_back() {
        let buffer = TaskBuffer::new(1).unwrap();
        buffer.try_add_new_task(token(0)).unwrap();

        let rejected = token(0);
        let id = rejected.task().id;
        let err = buffer.try_add_new_task(rejected).unwrap_err();

        assert!(err.is_full());
        assert_eq!(err.into_token().task().id, id);
        assert!(buffer.is_full());
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let buffer = TaskBuffer::new(10).unwrap();
        let low = token(0);
        let high_first = token(5);
        let high_second = token(5);
        let ids = [high_first.task().id, high_second.task().id, low.task().id];

        buffer.try_add_new_task(low).unwrap();
        buffer.try_add_new_task(high_first).unwrap();
        buffer.try_add_new_task(high_second).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| buffer.try_get_next_task())
            .map(|t| t.task().id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_is_completed_requires_drain() {
        let buffer = TaskBuffer::new(4).unwrap();
        buffer.try_add_new_task(token(0)).unwrap();
        buffer.complete_adding();
        buffer.complete_adding();

        assert!(!buffer.is_completed());
        assert!(buffer.is_adding_completed());
        assert!(matches!(
            buffer.try_add_new_task(token(0)),
            Err(TryAddError::Completed(_))
        ));

        assert!(buffer.try_get_next_task().is_some());
        assert!(buffer.try_get_next_task().is_none());
        assert!(buffer.is_completed());
    }

    #[test]
    fn test_fill_and_empty_metrics() {
        let buffer = TaskBuffer::new(2).unwrap();

        for _ in 0..2 {
            buffer.try_add_new_task(token(0)).unwrap();
            buffer.try_add_new_task(token(0)).unwrap();
            buffer.try_get_next_task().unwrap();
            buffer.try_get_next_task().unwrap();
        }

        assert_eq!(metric(&buffer, AppMetricId::BufferTimesFilled), 2);
        assert_eq!(metric(&buffer, AppMetricId::BufferTimesEmptied), 2);
        assert_eq!(metric(&buffer, AppMetricId::BufferMaxCount), 2);
        assert_eq!(metric(&buffer, AppMetricId::BufferMinCount), 0);
    }

    #[tokio::test]
    async fn test_next_task_returns_none_when_completed() {
        let buffer = Arc::new(TaskBuffer::new(2).unwrap());
        let cancel = CancellationToken::new();

        let waiter = {
            let buffer = Arc::clone(&buffer);
            let cancel = cancel.clone();
            tokio::spawn(async move { buffer.next_task(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.complete_adding();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_next_task_honours_cancellation() {
        let buffer = TaskBuffer::new(2).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(buffer.next_task(&cancel).await.is_none());
        assert!(!buffer.is_completed());
    }

    #[test]
    fn test_waiting_consumer_woken_by_add() {
        let buffer = TaskBuffer::new(2).unwrap();
        let cancel = CancellationToken::new();
        let added = token(3);
        let id = added.task().id;

        let mut waiter = tokio_test::task::spawn(buffer.next_task(&cancel));
        tokio_test::assert_pending!(waiter.poll());

        buffer.try_add_new_task(added).unwrap();
        assert!(waiter.is_woken());
        let got = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(got.map(|t| t.task().id), Some(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_producers_and_consumers_lose_nothing() {
        let buffer = Arc::new(TaskBuffer::new(10).unwrap());
        let produced = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut producers = Vec::new();
        for _ in 0..4 {
            let buffer = Arc::clone(&buffer);
            let produced = Arc::clone(&produced);
            let count = rand::thread_rng().gen_range(1..100);
            producers.push(tokio::spawn(async move {
                for _ in 0..count {
                    let mut pending = token(0);
                    loop {
                        match buffer.try_add_new_task(pending) {
                            Ok(()) => break,
                            Err(e) => {
                                pending = e.into_token();
                                tokio::task::yield_now().await;
                            }
                        }
                    }
                    produced.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let buffer = Arc::clone(&buffer);
            let consumed = Arc::clone(&consumed);
            let cancel = cancel.clone();
            consumers.push(tokio::spawn(async move {
                while buffer.next_task(&cancel).await.is_some() {
                    assert!(buffer.count() <= buffer.capacity());
                    consumed.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }));
        }

        for p in producers {
            p.await.unwrap();
        }
        buffer.complete_adding();
        for c in consumers {
            tokio::time::timeout(Duration::from_secs(5), c)
                .await
                .unwrap()
                .unwrap();
        }

        assert!(buffer.is_completed());
        assert_eq!(
            consumed.load(AtomicOrdering::SeqCst),
            produced.load(AtomicOrdering::SeqCst)
        );
    }
}

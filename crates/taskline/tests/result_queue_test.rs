//! Result queue behaviour during store outages
//!
//! Run with: cargo test -p taskline --test result_queue_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use taskline::metrics::{AppMetricId, AppMetricsProvider};
use taskline::model::{NewTask, QueuedTaskResult, QueuedTaskStatus};
use taskline::persistence::{
    InMemoryTaskStore, ResultSink, StoreError, TaskQueueConsumer, TaskQueueInfo,
    TaskQueueProducer,
};
use taskline::results::{
    BackupError, FileResultQueueBackup, InMemoryResultQueueBackup, ResultQueue, ResultQueueBackup,
    ResultQueueConfig,
};

/// Sink that fails with a database error a set number of times
struct FlakySink {
    store: Arc<InMemoryTaskStore>,
    failures_left: AtomicU32,
    writes: Mutex<Vec<QueuedTaskResult>>,
}

impl FlakySink {
    fn new(store: Arc<InMemoryTaskStore>, failures: u32) -> Self {
        Self {
            store,
            failures_left: AtomicU32::new(failures),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn recover(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }

    fn writes(&self) -> Vec<QueuedTaskResult> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn write_result(&self, result: &QueuedTaskResult) -> Result<(), StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        self.store.write_result(result).await?;
        self.writes.lock().push(result.clone());
        Ok(())
    }
}

/// Backup whose disk is full
struct FullBackup;

#[async_trait]
impl ResultQueueBackup for FullBackup {
    async fn init(&self) -> Result<(), BackupError> {
        Ok(())
    }

    async fn put(&self, _result: &QueuedTaskResult) -> Result<(), BackupError> {
        Err(BackupError::Io(std::io::Error::other("no space left on device")))
    }

    async fn remove(&self, _id: Uuid) -> Result<(), BackupError> {
        Ok(())
    }

    async fn retrieve_backed_up_items(&self) -> Result<Vec<QueuedTaskResult>, BackupError> {
        Ok(Vec::new())
    }
}

fn config() -> ResultQueueConfig {
    ResultQueueConfig::default()
        .with_write_timeout(Duration::from_millis(200))
        .with_reconciliation_interval(Duration::from_millis(20))
}

/// Post a task and claim it, returning its processed result
async fn processed_result(store: &InMemoryTaskStore) -> QueuedTaskResult {
    store
        .post_task(NewTask::new("noop", json!({})))
        .await
        .unwrap();
    let token = store.dequeue().await.unwrap().unwrap();
    let (_, mut result) = token.into_parts();
    result.mark_processed(3, Utc::now()).unwrap();
    result
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test_log::test(tokio::test)]
async fn test_failed_write_is_reconciled_exactly_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sink = Arc::new(FlakySink::new(Arc::clone(&store), 1));
    let backup = Arc::new(InMemoryResultQueueBackup::new());
    let queue = ResultQueue::new(sink.clone(), backup.clone(), config());
    queue.start().await.unwrap();

    let result = processed_result(&store).await;
    queue.post_result(result.clone()).unwrap();

    let observed = Arc::clone(&sink);
    eventually(|| observed.writes().len() == 1).await;
    queue.stop().await;

    assert_eq!(sink.writes(), vec![result.clone()]);
    assert!(backup.is_empty());
    let stored = store.task_result(result.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueuedTaskStatus::Processed);
    assert_eq!(
        queue
            .query_metric(AppMetricId::ResultQueueResultWritesCount)
            .unwrap()
            .value,
        1
    );
    assert_eq!(
        queue
            .query_metric(AppMetricId::ResultQueueResultPostCount)
            .unwrap()
            .value,
        1
    );
}

#[tokio::test]
async fn test_latest_result_wins_after_outage() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sink = Arc::new(FlakySink::new(Arc::clone(&store), u32::MAX));
    let backup = Arc::new(InMemoryResultQueueBackup::new());
    let queue = ResultQueue::new(
        sink.clone(),
        backup.clone(),
        config().with_reconciliation_interval(Duration::from_secs(60)),
    );
    queue.start().await.unwrap();

    store
        .post_task(NewTask::new("noop", json!({})))
        .await
        .unwrap();
    let token = store.dequeue().await.unwrap().unwrap();
    let (_, first) = token.into_parts();
    let mut second = first.clone();
    second.mark_processed(7, Utc::now()).unwrap();

    queue.post_result(first).unwrap();
    queue.post_result(second.clone()).unwrap();

    let pending = Arc::clone(&backup);
    eventually(|| pending.len() == 1).await;

    // Stop drains the channel and reconciles once more
    sink.recover();
    queue.stop().await;

    assert!(backup.is_empty());
    assert_eq!(sink.writes(), vec![second.clone()]);
    let stored = store.task_result(second.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueuedTaskStatus::Processed);
    assert_eq!(stored.processing_time_ms, 7);
}

#[test_log::test(tokio::test)]
async fn test_result_survives_failing_sink_and_backup() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sink = Arc::new(FlakySink::new(Arc::clone(&store), 1));
    let queue = ResultQueue::new(sink.clone(), Arc::new(FullBackup), config());
    queue.start().await.unwrap();

    let result = processed_result(&store).await;
    queue.post_result(result.clone()).unwrap();

    // Written by a reconciliation tick, not by stop
    let observed = Arc::clone(&sink);
    eventually(|| observed.writes().len() == 1).await;
    queue.stop().await;

    assert_eq!(sink.writes(), vec![result.clone()]);
    let stored = store.task_result(result.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueuedTaskStatus::Processed);
}

#[tokio::test]
async fn test_held_result_is_written_on_stop() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sink = Arc::new(FlakySink::new(Arc::clone(&store), u32::MAX));
    let queue = ResultQueue::new(
        sink.clone(),
        Arc::new(FullBackup),
        config().with_reconciliation_interval(Duration::from_secs(60)),
    );
    queue.start().await.unwrap();

    let result = processed_result(&store).await;
    queue.post_result(result.clone()).unwrap();
    // Let the failed write happen while the store is still down
    tokio::time::sleep(Duration::from_millis(50)).await;

    sink.recover();
    queue.stop().await;

    assert_eq!(sink.writes(), vec![result.clone()]);
    assert_eq!(
        store.task_result(result.id).await.unwrap().unwrap().status,
        QueuedTaskStatus::Processed
    );
}

#[tokio::test]
async fn test_rejected_result_is_dropped() {
    let store = Arc::new(InMemoryTaskStore::new());
    let backup = Arc::new(InMemoryResultQueueBackup::new());
    let queue = ResultQueue::new(store.clone(), backup.clone(), config());
    queue.start().await.unwrap();

    // Never posted, so the store reports it as missing
    let orphan = QueuedTaskResult::new(&NewTask::new("noop", json!({})).into_queued(Utc::now()));
    queue.post_result(orphan).unwrap();
    queue.stop().await;

    assert!(backup.is_empty());
    assert_eq!(
        queue
            .query_metric(AppMetricId::ResultQueueResultWritesCount)
            .unwrap()
            .value,
        0
    );
}

#[tokio::test]
async fn test_file_backup_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryTaskStore::new());
    let result = processed_result(&store).await;

    // First process: the store is down for good
    let down = Arc::new(FlakySink::new(Arc::clone(&store), u32::MAX));
    let queue = ResultQueue::new(
        down,
        Arc::new(FileResultQueueBackup::new(dir.path())),
        config(),
    );
    queue.start().await.unwrap();
    queue.post_result(result.clone()).unwrap();
    queue.stop().await;

    let backup = FileResultQueueBackup::new(dir.path());
    assert_eq!(
        backup.retrieve_backed_up_items().await.unwrap(),
        vec![result.clone()]
    );

    // Second process: reconciliation runs as soon as the queue starts
    let sink = Arc::new(FlakySink::new(Arc::clone(&store), 0));
    let queue = ResultQueue::new(sink.clone(), Arc::new(backup.clone()), config());
    queue.start().await.unwrap();

    let observed = Arc::clone(&sink);
    eventually(|| observed.writes().len() == 1).await;
    queue.stop().await;

    assert!(backup.retrieve_backed_up_items().await.unwrap().is_empty());
    let stored = store.task_result(result.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueuedTaskStatus::Processed);
}

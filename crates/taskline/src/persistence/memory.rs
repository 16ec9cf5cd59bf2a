//! In-memory task store for testing

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::*;
use crate::listener::InMemoryNotificationSource;
use crate::model::{
    ModelError, NewTask, QueuedTask, QueuedTaskResult, QueuedTaskStatus, QueuedTaskToken,
};

/// Internal task state
struct StoredTask {
    task: QueuedTask,
    result: QueuedTaskResult,
    /// Claim lease; only meaningful while processing
    locked_until: Option<DateTime<Utc>>,
}

impl StoredTask {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.result.is_eligible(now) || self.lease_expired(now)
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.result.status == QueuedTaskStatus::Processing
            && self.locked_until.is_some_and(|until| until <= now)
    }
}

/// In-memory implementation of the task store
///
/// This is primarily for testing. It provides the same claiming semantics
/// as the PostgreSQL implementation: dequeue is a single step under the
/// write lock, so a task is never handed to two consumers while its claim
/// lease holds.
///
/// # Example
///
/// ```
/// use taskline::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, StoredTask>>,
    notifications: Option<(InMemoryNotificationSource, String)>,
    claim_lease: chrono::Duration,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            notifications: None,
            claim_lease: lease_from_std(DEFAULT_CLAIM_LEASE),
        }
    }

    /// Let other consumers take over a claim after `lease`
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease_from_std(lease);
        self
    }

    /// Publish a notification on `channel` for every posted task
    pub fn with_notifications(
        mut self,
        source: InMemoryNotificationSource,
        channel: impl Into<String>,
    ) -> Self {
        self.notifications = Some((source, channel.into()));
        self
    }

    /// Number of stored tasks
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Results of every stored task
    pub fn results(&self) -> Vec<QueuedTaskResult> {
        self.tasks
            .read()
            .values()
            .map(|stored| stored.result.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueueProducer for InMemoryTaskStore {
    async fn post_task(&self, task: NewTask) -> Result<QueuedTask, StoreError> {
        let task = task.into_queued(Utc::now());
        let result = QueuedTaskResult::new(&task);
        self.tasks.write().insert(
            task.id,
            StoredTask {
                task: task.clone(),
                result,
                locked_until: None,
            },
        );

        if let Some((source, channel)) = &self.notifications {
            source.publish(channel, &task.id.to_string());
        }
        debug!(task_id = %task.id, task_type = %task.task_type, "Posted task");
        Ok(task)
    }
}

#[async_trait]
impl TaskQueueConsumer for InMemoryTaskStore {
    async fn dequeue(&self) -> Result<Option<QueuedTaskToken>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let next = tasks
            .values_mut()
            .filter(|stored| stored.is_claimable(now))
            .max_by_key(|stored| (stored.task.priority, Reverse(stored.task.posted_at)));

        let Some(stored) = next else {
            return Ok(None);
        };

        if stored.result.status == QueuedTaskStatus::Processing {
            warn!(task_id = %stored.task.id, "Reclaiming task whose claim lease expired");
            stored.result.reclaim(now)?;
        } else {
            stored.result.mark_processing(now)?;
        }
        stored.locked_until = now.checked_add_signed(self.claim_lease);
        Ok(Some(QueuedTaskToken::new(
            stored.task.clone(),
            stored.result.clone(),
            now,
        )))
    }

    async fn release(&self, token: QueuedTaskToken) -> Result<(), StoreError> {
        let (task, _) = token.into_parts();
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;

        if stored.result.status == QueuedTaskStatus::Processing {
            stored.result.release()?;
        }
        stored.locked_until = None;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for InMemoryTaskStore {
    async fn write_result(&self, result: &QueuedTaskResult) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&result.id)
            .ok_or(StoreError::TaskNotFound(result.id))?;

        if stored.result.status.is_terminal() && stored.result.status != result.status {
            return Err(ModelError::TerminalStatus {
                id: result.id,
                status: stored.result.status,
            }
            .into());
        }

        stored.result = result.clone();
        if result.status != QueuedTaskStatus::Processing {
            stored.locked_until = None;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueueInfo for InMemoryTaskStore {
    async fn task_result(&self, id: Uuid) -> Result<Option<QueuedTaskResult>, StoreError> {
        Ok(self.tasks.read().get(&id).map(|stored| stored.result.clone()))
    }

    async fn count_by_status(&self, status: QueuedTaskStatus) -> Result<u64, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|stored| stored.result.status == status)
            .count() as u64)
    }
}

fn lease_from_std(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_post_and_dequeue() {
        let store = InMemoryTaskStore::new();
        let posted = store
            .post_task(NewTask::new("email", json!({"to": "a@example.com"})))
            .await
            .unwrap();

        let token = store.dequeue().await.unwrap().unwrap();
        assert_eq!(token.task().id, posted.id);
        assert_eq!(token.result().status, QueuedTaskStatus::Processing);
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_prefers_priority_then_age() {
        let store = InMemoryTaskStore::new();
        let old_low = store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        let high = store
            .post_task(NewTask::new("b", json!({})).with_priority(10))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let new_low = store.post_task(NewTask::new("c", json!({}))).await.unwrap();

        let order: Vec<Uuid> = vec![
            store.dequeue().await.unwrap().unwrap().task().id,
            store.dequeue().await.unwrap().unwrap().task().id,
            store.dequeue().await.unwrap().unwrap().task().id,
        ];
        assert_eq!(order, vec![high.id, old_low.id, new_low.id]);
    }

    #[tokio::test]
    async fn test_retry_at_in_future_is_not_eligible() {
        let store = InMemoryTaskStore::new();
        store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        let token = store.dequeue().await.unwrap().unwrap();

        let mut result = token.result().clone();
        result
            .mark_failed(crate::model::QueuedTaskError::new("io", "x"), true, 0)
            .unwrap();
        result
            .requeue(Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        store.write_result(&result).await.unwrap();

        assert!(store.dequeue().await.unwrap().is_none());
        assert_eq!(
            store
                .count_by_status(QueuedTaskStatus::Unprocessed)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_release_makes_task_eligible_again() {
        let store = InMemoryTaskStore::new();
        store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        let token = store.dequeue().await.unwrap().unwrap();
        let id = token.task().id;

        store.release(token).await.unwrap();

        let again = store.dequeue().await.unwrap().unwrap();
        assert_eq!(again.task().id, id);
        assert_eq!(again.result().fault_count, 0);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_redelivered_after_lease() {
        let store = InMemoryTaskStore::new().with_claim_lease(Duration::from_millis(50));
        let posted = store.post_task(NewTask::new("a", json!({}))).await.unwrap();

        // Consumer goes away without posting a result or releasing
        drop(store.dequeue().await.unwrap().unwrap());
        assert!(store.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let again = store.dequeue().await.unwrap().unwrap();
        assert_eq!(again.task().id, posted.id);
        assert_eq!(again.result().status, QueuedTaskStatus::Processing);
        assert_eq!(again.result().fault_count, 0);

        // A fresh lease protects the new claim
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_task_is_not_reclaimed() {
        let store = InMemoryTaskStore::new().with_claim_lease(Duration::from_millis(20));
        store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        let token = store.dequeue().await.unwrap().unwrap();

        let mut done = token.result().clone();
        done.mark_processed(1, Utc::now()).unwrap();
        store.write_result(&done).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_result_for_unknown_task_fails() {
        let store = InMemoryTaskStore::new();
        let orphan = QueuedTaskResult::new(&NewTask::new("a", json!({})).into_queued(Utc::now()));

        let err = store.write_result(&orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(id) if id == orphan.id));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_terminal_result_is_not_overwritten() {
        let store = InMemoryTaskStore::new();
        store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        let token = store.dequeue().await.unwrap().unwrap();

        let stale = token.result().clone();
        let mut done = stale.clone();
        done.mark_processed(3, Utc::now()).unwrap();
        store.write_result(&done).await.unwrap();
        store.write_result(&done).await.unwrap();

        let err = store.write_result(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Model(ModelError::TerminalStatus { .. })));
        assert_eq!(
            store.task_result(done.id).await.unwrap().unwrap().status,
            QueuedTaskStatus::Processed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_never_duplicates() {
        let store = Arc::new(InMemoryTaskStore::new());
        for _ in 0..200 {
            store.post_task(NewTask::new("a", json!({}))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(token) = store.dequeue().await.unwrap() {
                    ids.push(token.task().id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}

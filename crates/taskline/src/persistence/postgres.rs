//! PostgreSQL implementation of the task store
//!
//! Production persistence using PostgreSQL with:
//! - Atomic task claiming with `FOR UPDATE SKIP LOCKED`
//! - A claim lease (`locked_until`) so tasks of vanished consumers are redelivered
//! - `pg_notify` on post so listeners re-poll promptly
//! - Guarded result writes that never reopen a terminal task

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ModelError, NewTask, QueuedTask, QueuedTaskError, QueuedTaskResult, QueuedTaskStatus,
    QueuedTaskToken,
};

/// Default LISTEN/NOTIFY channel for new tasks
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "taskline_new_task";

const TASK_COLUMNS: &str = "id, task_type, source, priority, payload, posted_at, status, \
     fault_count, last_error, last_error_recoverable, retry_at, first_processing_attempted_at, \
     last_processing_attempted_at, processing_finalized_at, processing_time_ms";

/// PostgreSQL implementation of the task store
///
/// Uses a connection pool for efficient database access. Any number of
/// processes may dequeue from the same table concurrently.
///
/// # Example
///
/// ```ignore
/// use taskline::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    notification_channel: String,
    claim_lease: Duration,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notification_channel: DEFAULT_NOTIFICATION_CHANNEL.to_string(),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Let other consumers take over a claim after `lease`
    ///
    /// Executions running longer than the lease may be delivered twice.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Notify on a different channel
    pub fn with_notification_channel(mut self, channel: impl Into<String>) -> Self {
        self.notification_channel = channel.into();
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn notification_channel(&self) -> &str {
        &self.notification_channel
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<QueuedTaskStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM taskline_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;

        row.map(|r| parse_status(&r)).transpose()
    }
}

fn database_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("column {name}: {e}")))
}

fn parse_status(row: &PgRow) -> Result<QueuedTaskStatus, StoreError> {
    let status: String = column(row, "status")?;
    QueuedTaskStatus::parse(&status)
        .ok_or_else(|| StoreError::Serialization(format!("unknown task status: {status}")))
}

fn row_to_parts(row: &PgRow) -> Result<(QueuedTask, QueuedTaskResult), StoreError> {
    let task = QueuedTask {
        id: column(row, "id")?,
        task_type: column(row, "task_type")?,
        source: column(row, "source")?,
        priority: column(row, "priority")?,
        posted_at: column(row, "posted_at")?,
        payload: column(row, "payload")?,
    };

    let fault_count: i32 = column(row, "fault_count")?;
    let last_error: Option<Json<QueuedTaskError>> = column(row, "last_error")?;

    let result = QueuedTaskResult {
        id: task.id,
        task_type: task.task_type.clone(),
        source: task.source.clone(),
        priority: task.priority,
        posted_at: task.posted_at,
        status: parse_status(row)?,
        fault_count: u32::try_from(fault_count).unwrap_or(0),
        last_error: last_error.map(|e| e.0),
        last_error_recoverable: column(row, "last_error_recoverable")?,
        retry_at: column(row, "retry_at")?,
        first_processing_attempted_at: column(row, "first_processing_attempted_at")?,
        last_processing_attempted_at: column(row, "last_processing_attempted_at")?,
        processing_finalized_at: column(row, "processing_finalized_at")?,
        processing_time_ms: column(row, "processing_time_ms")?,
    };

    Ok((task, result))
}

#[async_trait]
impl TaskQueueProducer for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn post_task(&self, task: NewTask) -> Result<QueuedTask, StoreError> {
        let task = task.into_queued(chrono::Utc::now());

        let mut tx = self.pool.begin().await.map_err(database_error)?;

        sqlx::query(
            r#"
            INSERT INTO taskline_tasks (id, task_type, source, priority, payload, posted_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'unprocessed')
            "#,
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(&task.source)
        .bind(task.priority)
        .bind(&task.payload)
        .bind(task.posted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to post task: {}", e);
            database_error(e)
        })?;

        // Delivered on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.notification_channel)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

        tx.commit().await.map_err(database_error)?;

        debug!(task_id = %task.id, "Posted task");
        Ok(task)
    }
}

#[async_trait]
impl TaskQueueConsumer for PostgresTaskStore {
    #[instrument(skip(self))]
    async fn dequeue(&self) -> Result<Option<QueuedTaskToken>, StoreError> {
        // SKIP LOCKED lets concurrent consumers pass over rows another
        // transaction is claiming; the UPDATE marks and leases the claim
        // atomically. Processing rows past their lease belong to a consumer
        // that went away.
        let query = format!(
            r#"
            WITH claimable AS (
                SELECT id, status AS previous_status
                FROM taskline_tasks
                WHERE (status = 'unprocessed' AND (retry_at IS NULL OR retry_at <= NOW()))
                   OR (status = 'processing' AND locked_until <= NOW())
                ORDER BY priority DESC, posted_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE taskline_tasks t
            SET status = 'processing',
                first_processing_attempted_at = COALESCE(t.first_processing_attempted_at, NOW()),
                last_processing_attempted_at = NOW(),
                retry_at = NULL,
                locked_until = NOW() + $1::double precision * INTERVAL '1 millisecond'
            FROM claimable c
            WHERE t.id = c.id
            RETURNING {}, NOW() AS dequeued_at, c.previous_status = 'processing' AS reclaimed
            "#,
            TASK_COLUMNS
                .split(", ")
                .map(|c| format!("t.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let lease_ms = self.claim_lease.as_secs_f64() * 1000.0;
        let row = sqlx::query(&query)
            .bind(lease_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim task: {}", e);
                database_error(e)
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let (task, result) = row_to_parts(&row)?;
        let dequeued_at = column(&row, "dequeued_at")?;
        let reclaimed: bool = column(&row, "reclaimed")?;
        if reclaimed {
            warn!(task_id = %task.id, "Reclaimed task whose claim lease expired");
        }
        debug!(task_id = %task.id, fault_count = result.fault_count, "Claimed task");
        Ok(Some(QueuedTaskToken::new(task, result, dequeued_at)))
    }

    #[instrument(skip(self, token), fields(task_id = %token.task().id))]
    async fn release(&self, token: QueuedTaskToken) -> Result<(), StoreError> {
        let id = token.task().id;
        let updated = sqlx::query(
            r#"
            UPDATE taskline_tasks
            SET status = 'unprocessed', locked_until = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if updated.rows_affected() == 0 && self.current_status(id).await?.is_none() {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for PostgresTaskStore {
    #[instrument(skip(self, result), fields(task_id = %result.id, status = %result.status))]
    async fn write_result(&self, result: &QueuedTaskResult) -> Result<(), StoreError> {
        let fault_count = i32::try_from(result.fault_count).unwrap_or(i32::MAX);

        let updated = sqlx::query(
            r#"
            UPDATE taskline_tasks
            SET status = $2,
                fault_count = $3,
                last_error = $4,
                last_error_recoverable = $5,
                retry_at = $6,
                first_processing_attempted_at = $7,
                last_processing_attempted_at = $8,
                processing_finalized_at = $9,
                processing_time_ms = $10,
                locked_until = CASE WHEN $2 = 'processing' THEN locked_until END
            WHERE id = $1
              AND (status NOT IN ('processed', 'cancelled', 'faulted') OR status = $2)
            "#,
        )
        .bind(result.id)
        .bind(result.status.as_str())
        .bind(fault_count)
        .bind(result.last_error.as_ref().map(Json))
        .bind(result.last_error_recoverable)
        .bind(result.retry_at)
        .bind(result.first_processing_attempted_at)
        .bind(result.last_processing_attempted_at)
        .bind(result.processing_finalized_at)
        .bind(result.processing_time_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to write task result: {}", e);
            database_error(e)
        })?;

        if updated.rows_affected() == 0 {
            return match self.current_status(result.id).await? {
                None => Err(StoreError::TaskNotFound(result.id)),
                Some(status) => Err(ModelError::TerminalStatus {
                    id: result.id,
                    status,
                }
                .into()),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueueInfo for PostgresTaskStore {
    async fn task_result(&self, id: Uuid) -> Result<Option<QueuedTaskResult>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM taskline_tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        row.map(|r| row_to_parts(&r).map(|(_, result)| result))
            .transpose()
    }

    async fn count_by_status(&self, status: QueuedTaskStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM taskline_tasks WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

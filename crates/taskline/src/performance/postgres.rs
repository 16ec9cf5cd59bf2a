//! PostgreSQL execution statistics writer

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

use super::stats::TaskExecutionStats;
use super::writer::ExecutionPerformanceWriter;
use crate::persistence::StoreError;

/// Upserts one row per task type into `taskline_task_execution_stats`
///
/// The table is created by the store migrations.
#[derive(Clone)]
pub struct PostgresExecutionPerformanceWriter {
    pool: PgPool,
}

impl PostgresExecutionPerformanceWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Accumulated statistics of `task_type`
    pub async fn stats(&self, task_type: &str) -> Result<Option<TaskExecutionStats>, StoreError> {
        let row: Option<(i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT execution_count, last_execution_ms, average_execution_ms,
                   fastest_execution_ms, longest_execution_ms, total_execution_ms
            FROM taskline_task_execution_stats
            WHERE task_type = $1
            "#,
        )
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|(count, last, average, fastest, longest, total)| TaskExecutionStats {
            execution_count: u64::try_from(count).unwrap_or(0),
            last_execution_ms: last,
            average_execution_ms: average,
            fastest_execution_ms: fastest,
            longest_execution_ms: longest,
            total_execution_ms: total,
        }))
    }
}

#[async_trait]
impl ExecutionPerformanceWriter for PostgresExecutionPerformanceWriter {
    #[instrument(skip(self, deltas), fields(task_types = deltas.len()))]
    async fn write(&self, deltas: &HashMap<String, TaskExecutionStats>) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for (task_type, delta) in deltas {
            sqlx::query(
                r#"
                INSERT INTO taskline_task_execution_stats AS s (
                    task_type, execution_count, last_execution_ms, average_execution_ms,
                    fastest_execution_ms, longest_execution_ms, total_execution_ms
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (task_type) DO UPDATE SET
                    execution_count = s.execution_count + EXCLUDED.execution_count,
                    last_execution_ms = EXCLUDED.last_execution_ms,
                    average_execution_ms = CEILING(
                        (s.total_execution_ms + EXCLUDED.total_execution_ms)::double precision
                            / (s.execution_count + EXCLUDED.execution_count)
                    )::bigint,
                    fastest_execution_ms = LEAST(s.fastest_execution_ms, EXCLUDED.fastest_execution_ms),
                    longest_execution_ms = GREATEST(s.longest_execution_ms, EXCLUDED.longest_execution_ms),
                    total_execution_ms = s.total_execution_ms + EXCLUDED.total_execution_ms
                "#,
            )
            .bind(task_type)
            .bind(i64::try_from(delta.execution_count).unwrap_or(i64::MAX))
            .bind(delta.last_execution_ms)
            .bind(delta.average_execution_ms)
            .bind(delta.fastest_execution_ms)
            .bind(delta.longest_execution_ms)
            .bind(delta.total_execution_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!(%task_type, "Failed to write execution stats: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        debug!(task_types = deltas.len(), "Wrote execution stats");
        Ok(())
    }
}

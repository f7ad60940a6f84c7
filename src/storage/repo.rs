//! # Task Repository
//!
//! All stateful operations of the scheduling kernel run here, each inside a
//! single `BEGIN IMMEDIATE` transaction:
//!
//! - **Atomic claim**: runnable rows (QUEUED, `remaining_deps = 0`) move to
//!   RUNNING with a lease; the store's write lock serializes competing
//!   claimers, so no row is ever claimed twice.
//! - **Completion propagation**: marking a task COMPLETED decrements its
//!   dependents' `remaining_deps` in the same transaction, so a runnable
//!   successor is never invisible to the claim query.
//! - **Recovery sweep**: RUNNING rows whose lease expired are requeued while
//!   attempts remain, else terminally failed.
//!
//! Transient busy/locked failures are retried once; everything else surfaces.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{Result, TaskmillError};
use crate::models::{dep, Task, TaskDetail, TaskStatus};
use crate::storage::db::{begin_immediate, finish, retry_once_if_busy};

/// Error text recorded when recovery takes a task away from a dead executor.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// A task handed to the worker pool by a claim.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ClaimedTask {
    pub id: String,
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct TaskRepo {
    pool: SqlitePool,
}

impl TaskRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -------------------------
    // Reads
    // -------------------------

    pub async fn get_task(&self, id: &str) -> Result<TaskDetail> {
        let mut conn = self.pool.acquire().await?;

        let task = Task::find_by_id(&mut conn, id)
            .await?
            .ok_or_else(|| TaskmillError::NotFound { id: id.to_string() })?;
        let dependencies = dep::dependencies_for(&mut conn, id).await?;

        Ok(TaskDetail { task, dependencies })
    }

    /// List tasks oldest-first, optionally filtered by status, with the total
    /// row count for the same filter.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<TaskDetail>, i64)> {
        let mut conn = self.pool.acquire().await?;

        let (tasks, total) = match status {
            Some(status) => {
                let tasks = sqlx::query_as::<_, Task>(
                    r#"
                    SELECT id, type, duration_ms, status, remaining_deps, attempts, max_attempts,
                           created_at, updated_at, started_at, finished_at, lease_expires_at, last_error
                    FROM tasks
                    WHERE status = ?
                    ORDER BY created_at ASC, id ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&mut *conn)
                .await?;
                let total =
                    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks WHERE status = ?")
                        .bind(status)
                        .fetch_one(&mut *conn)
                        .await?;
                (tasks, total)
            }
            None => {
                let tasks = sqlx::query_as::<_, Task>(
                    r#"
                    SELECT id, type, duration_ms, status, remaining_deps, attempts, max_attempts,
                           created_at, updated_at, started_at, finished_at, lease_expires_at, last_error
                    FROM tasks
                    ORDER BY created_at ASC, id ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&mut *conn)
                .await?;
                let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks")
                    .fetch_one(&mut *conn)
                    .await?;
                (tasks, total)
            }
        };

        let mut details = Vec::with_capacity(tasks.len());
        for task in tasks {
            let dependencies = dep::dependencies_for(&mut conn, &task.id).await?;
            details.push(TaskDetail { task, dependencies });
        }

        Ok((details, total))
    }

    /// RUNNING rows whose lease is still live (or unset). Expired leases do
    /// not count toward capacity, which is what lets the engine make forward
    /// progress when executors die.
    pub async fn count_running(&self, now_ms: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM tasks
            WHERE status = ?
              AND (lease_expires_at IS NULL OR lease_expires_at >= ?)
            "#,
        )
        .bind(TaskStatus::Running)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // -------------------------
    // Kernel writes
    // -------------------------

    /// Atomically claim up to `limit` runnable tasks, marking them RUNNING
    /// with a lease of `lease_ms`. Candidates are ordered oldest-first with
    /// the id as a deterministic tiebreak; `attempts` increments here and
    /// only here.
    pub async fn claim_runnable(
        &self,
        now_ms: i64,
        lease_ms: i64,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        retry_once_if_busy(|| self.claim_runnable_once(now_ms, lease_ms, limit)).await
    }

    async fn claim_runnable_once(
        &self,
        now_ms: i64,
        lease_ms: i64,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::claim_runnable_tx(&mut conn, now_ms, lease_ms, limit).await;
        finish(&mut conn, result).await
    }

    async fn claim_runnable_tx(
        conn: &mut SqliteConnection,
        now_ms: i64,
        lease_ms: i64,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>> {
        let candidates = sqlx::query_as::<_, ClaimedTask>(
            r#"
            SELECT id, duration_ms
            FROM tasks
            WHERE status = ? AND remaining_deps = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(TaskStatus::Queued)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            // The UPDATE re-checks the runnable guard; a zero-row update is
            // not a claim.
            let affected = sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?,
                    attempts = attempts + 1,
                    started_at = ?,
                    lease_expires_at = ?,
                    updated_at = ?
                WHERE id = ? AND status = ? AND remaining_deps = 0
                "#,
            )
            .bind(TaskStatus::Running)
            .bind(now_ms)
            .bind(now_ms + lease_ms)
            .bind(now_ms)
            .bind(&candidate.id)
            .bind(TaskStatus::Queued)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if affected == 1 {
                claimed.push(candidate);
            }
        }

        Ok(claimed)
    }

    /// Mark a RUNNING task COMPLETED and unblock its dependents by
    /// decrementing their `remaining_deps`, all in one transaction.
    pub async fn mark_completed(&self, id: &str, now_ms: i64) -> Result<()> {
        retry_once_if_busy(|| self.mark_completed_once(id, now_ms)).await
    }

    async fn mark_completed_once(&self, id: &str, now_ms: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::mark_completed_tx(&mut conn, id, now_ms).await;
        finish(&mut conn, result).await
    }

    async fn mark_completed_tx(conn: &mut SqliteConnection, id: &str, now_ms: i64) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                finished_at = ?,
                lease_expires_at = NULL,
                last_error = NULL
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(TaskStatus::Completed)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .bind(TaskStatus::Running)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(Self::not_running_error(conn, id).await?);
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET remaining_deps = CASE
                    WHEN remaining_deps > 0 THEN remaining_deps - 1
                    ELSE 0
                END,
                updated_at = ?
            WHERE id IN (SELECT task_id FROM deps WHERE depends_on_id = ?)
              AND status = ?
            "#,
        )
        .bind(now_ms)
        .bind(id)
        .bind(TaskStatus::Queued)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Record a failed RUNNING episode: requeue while the row has attempts
    /// left, otherwise fail terminally and block all still-QUEUED transitive
    /// descendants.
    pub async fn mark_failed_or_retry(&self, id: &str, now_ms: i64, error: &str) -> Result<()> {
        retry_once_if_busy(|| self.mark_failed_or_retry_once(id, now_ms, error)).await
    }

    async fn mark_failed_or_retry_once(&self, id: &str, now_ms: i64, error: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::mark_failed_or_retry_tx(&mut conn, id, now_ms, error).await;
        finish(&mut conn, result).await
    }

    async fn mark_failed_or_retry_tx(
        conn: &mut SqliteConnection,
        id: &str,
        now_ms: i64,
        error: &str,
    ) -> Result<()> {
        let task = Task::find_by_id(&mut *conn, id)
            .await?
            .ok_or_else(|| TaskmillError::NotFound { id: id.to_string() })?;

        if task.status != TaskStatus::Running {
            return Err(TaskmillError::StateConflict {
                id: id.to_string(),
                status: task.status.to_string(),
            });
        }

        if task.attempts < task.max_attempts {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?,
                    updated_at = ?,
                    started_at = NULL,
                    lease_expires_at = NULL,
                    last_error = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(TaskStatus::Queued)
            .bind(now_ms)
            .bind(error)
            .bind(id)
            .bind(TaskStatus::Running)
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?,
                    updated_at = ?,
                    finished_at = ?,
                    lease_expires_at = NULL,
                    last_error = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(TaskStatus::Failed)
            .bind(now_ms)
            .bind(now_ms)
            .bind(error)
            .bind(id)
            .bind(TaskStatus::Running)
            .execute(&mut *conn)
            .await?;

            Self::block_descendants(conn, id, now_ms).await?;
        }

        Ok(())
    }

    /// Requeue or terminally fail every RUNNING row whose lease expired
    /// before `now_ms`. Returns the number of rows transitioned.
    pub async fn sweep_expired_leases(&self, now_ms: i64) -> Result<u64> {
        retry_once_if_busy(|| self.sweep_expired_leases_once(now_ms)).await
    }

    async fn sweep_expired_leases_once(&self, now_ms: i64) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::sweep_expired_leases_tx(&mut conn, now_ms).await;
        finish(&mut conn, result).await
    }

    async fn sweep_expired_leases_tx(conn: &mut SqliteConnection, now_ms: i64) -> Result<u64> {
        let requeued = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                started_at = NULL,
                lease_expires_at = NULL,
                last_error = ?
            WHERE status = ?
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < ?
              AND attempts < max_attempts
            "#,
        )
        .bind(TaskStatus::Queued)
        .bind(now_ms)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(TaskStatus::Running)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let failed = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                finished_at = ?,
                lease_expires_at = NULL,
                last_error = ?
            WHERE status = ?
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < ?
              AND attempts >= max_attempts
            RETURNING id
            "#,
        )
        .bind(TaskStatus::Failed)
        .bind(now_ms)
        .bind(now_ms)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(TaskStatus::Running)
        .bind(now_ms)
        .fetch_all(&mut *conn)
        .await?;

        for id in &failed {
            Self::block_descendants(conn, id, now_ms).await?;
        }

        let transitioned = requeued + failed.len() as u64;
        if transitioned > 0 {
            debug!(requeued, failed = failed.len(), "recovery sweep transitioned stale tasks");
        }

        Ok(transitioned)
    }

    /// Move every still-QUEUED task downstream of `failed_id` to BLOCKED.
    /// BLOCKED is terminal; `remaining_deps` is not maintained past here.
    async fn block_descendants(
        conn: &mut SqliteConnection,
        failed_id: &str,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            WITH RECURSIVE downstream(id) AS (
                SELECT task_id FROM deps WHERE depends_on_id = ?
                UNION
                SELECT d.task_id
                FROM deps d
                JOIN downstream w ON d.depends_on_id = w.id
            )
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                last_error = ?
            WHERE id IN (SELECT id FROM downstream)
              AND status = ?
            "#,
        )
        .bind(failed_id)
        .bind(TaskStatus::Blocked)
        .bind(now_ms)
        .bind(format!("dependency failed: {failed_id}"))
        .bind(TaskStatus::Queued)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Distinguish a missing row from a row in the wrong state.
    async fn not_running_error(conn: &mut SqliteConnection, id: &str) -> Result<TaskmillError> {
        match Task::find_by_id(conn, id).await? {
            None => Ok(TaskmillError::NotFound { id: id.to_string() }),
            Some(task) => Ok(TaskmillError::StateConflict {
                id: id.to_string(),
                status: task.status.to_string(),
            }),
        }
    }
}

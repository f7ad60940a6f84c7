//! SQLite pool construction and transaction primitives.
//!
//! Every kernel write runs inside `BEGIN IMMEDIATE`: the write lock is taken
//! at transaction start, so two transactions can never both observe a row as
//! QUEUED and both move it to RUNNING. That lock is the engine's only
//! coordination primitive.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::error::{Result, TaskmillError};

/// Open (creating if necessary) the database at `path` and return a pool.
///
/// Pragmas applied per connection: WAL journaling, NORMAL synchronous,
/// foreign keys ON, 5 s busy timeout.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(5_000))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Begin a transaction that acquires the write lock immediately.
pub async fn begin_immediate(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

/// Commit on success, roll back on error, preserving the original error.
pub async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED and their extended codes.
pub fn is_transient(err: &TaskmillError) -> bool {
    let TaskmillError::Store(sqlx::Error::Database(db_err)) = err else {
        return false;
    };
    matches!(
        db_err.code().as_deref(),
        Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
    )
}

/// Run a store operation, retrying exactly once if it failed with a
/// transient busy/locked error.
pub async fn retry_once_if_busy<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(err) if is_transient(&err) => op().await,
        other => other,
    }
}

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use taskmill::models::TaskStatus;
use taskmill::storage::{self, TaskRepo};
use taskmill::submit::{SubmitService, TaskSpec};

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// A migrated SQLite database backed by a temp directory; files are removed
/// when the harness drops.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("create temp dir");
    let pool = storage::open_pool(&dir.path().join("tasks.db"))
        .await
        .expect("open pool");
    storage::apply_migrations(&pool, Path::new("migrations"))
        .await
        .expect("apply migrations");
    TestDb { pool, _dir: dir }
}

pub fn repo(db: &TestDb) -> TaskRepo {
    TaskRepo::new(db.pool.clone())
}

pub fn submit_service(db: &TestDb) -> SubmitService {
    SubmitService::new(db.pool.clone(), DEFAULT_MAX_ATTEMPTS)
}

pub fn spec(id: &str, duration_ms: i64, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        task_type: "sleep".to_string(),
        duration_ms,
        max_attempts: None,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
}

/// Poll until the task reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    repo: &TaskRepo,
    id: &str,
    status: TaskStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(detail) = repo.get_task(id).await {
            if detail.task.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

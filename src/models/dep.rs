//! Dependency edges: `(task_id, depends_on_id)` meaning `task_id` must not
//! run until `depends_on_id` is COMPLETED.

use sqlx::SqliteConnection;

pub async fn insert(
    conn: &mut SqliteConnection,
    task_id: &str,
    depends_on_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO deps (task_id, depends_on_id) VALUES (?, ?)")
        .bind(task_id)
        .bind(depends_on_id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Ids this task depends on, sorted for stable output.
pub async fn dependencies_for(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT depends_on_id FROM deps WHERE task_id = ? ORDER BY depends_on_id ASC",
    )
    .bind(task_id)
    .fetch_all(conn)
    .await
}

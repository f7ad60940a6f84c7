//! Migration runner.
//!
//! Migrations are SQL files named `NNN_description.sql`, applied in ascending
//! numeric order. Applied versions are tracked in `schema_migrations`; the
//! files themselves are idempotent (`IF NOT EXISTS`) so a partially recorded
//! run is safe to repeat.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{Result, TaskmillError};
use crate::time::now_ms;

/// A single discovered migration file.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub filename: String,
    pub path: PathBuf,
}

/// Apply all pending migrations from `dir`. Returns how many were applied.
pub async fn apply_migrations(pool: &SqlitePool, dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Err(TaskmillError::Config(format!(
            "migrations directory not found: {}",
            dir.display()
        )));
    }

    ensure_migrations_table(pool).await?;

    let applied = applied_versions(pool).await?;
    let pending: Vec<Migration> = discover_migrations(dir)?
        .into_values()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if pending.is_empty() {
        debug!("no pending migrations");
        return Ok(0);
    }

    for migration in &pending {
        info!(
            version = migration.version,
            filename = %migration.filename,
            "applying migration"
        );
        let sql = fs::read_to_string(&migration.path)?;
        sqlx::raw_sql(&sql).execute(pool).await?;
        sqlx::query("INSERT INTO schema_migrations (version, filename, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(&migration.filename)
            .bind(now_ms())
            .execute(pool)
            .await?;
    }

    Ok(pending.len())
}

async fn ensure_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            filename TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn applied_versions(pool: &SqlitePool) -> Result<HashSet<i64>> {
    let versions = sqlx::query_scalar::<_, i64>("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    Ok(versions.into_iter().collect())
}

fn discover_migrations(dir: &Path) -> Result<BTreeMap<i64, Migration>> {
    let mut migrations = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(version) = parse_version(stem) else {
            continue;
        };
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        migrations.insert(
            version,
            Migration {
                version,
                filename,
                path,
            },
        );
    }

    Ok(migrations)
}

/// Parse the numeric prefix of `NNN_description`; non-conforming names are
/// ignored by the runner.
fn parse_version(stem: &str) -> Option<i64> {
    let (version_part, _) = stem.split_once('_')?;
    if version_part.is_empty() || !version_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    version_part.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_prefixes() {
        assert_eq!(parse_version("001_init"), Some(1));
        assert_eq!(parse_version("042_add_indexes"), Some(42));
    }

    #[test]
    fn rejects_non_conforming_names() {
        assert_eq!(parse_version("init"), None);
        assert_eq!(parse_version("_init"), None);
        assert_eq!(parse_version("v2_init"), None);
    }
}

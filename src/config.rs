//! Process configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use crate::error::{Result, TaskmillError};

/// Runtime settings for the engine and its HTTP surface.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub max_concurrent_tasks: usize,
    pub sched_tick_ms: u64,
    pub lease_ms: i64,
    pub max_attempts: i64,
    pub recovery_interval_ms: i64,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// Env vars: `DB_PATH`, `MAX_CONCURRENT`, `SCHED_TICK_MS`, `LEASE_MS`,
    /// `MAX_ATTEMPTS`, `RECOVERY_INTERVAL_MS`, `HOST`, `PORT`, `LOG_LEVEL`.
    pub fn load() -> Result<Settings> {
        let db_path = PathBuf::from(env_str("DB_PATH", "./var/taskmill.db"));

        let max_concurrent_tasks = parse_int("MAX_CONCURRENT", env::var("MAX_CONCURRENT").ok(), 3)?;
        require_positive("MAX_CONCURRENT", max_concurrent_tasks)?;

        let sched_tick_ms = parse_int("SCHED_TICK_MS", env::var("SCHED_TICK_MS").ok(), 200)?;
        require_positive("SCHED_TICK_MS", sched_tick_ms)?;

        let lease_ms = parse_int("LEASE_MS", env::var("LEASE_MS").ok(), 60_000)?;
        require_positive("LEASE_MS", lease_ms)?;

        let max_attempts = parse_int("MAX_ATTEMPTS", env::var("MAX_ATTEMPTS").ok(), 3)?;
        require_positive("MAX_ATTEMPTS", max_attempts)?;

        let recovery_interval_ms = parse_int(
            "RECOVERY_INTERVAL_MS",
            env::var("RECOVERY_INTERVAL_MS").ok(),
            5_000,
        )?;
        require_positive("RECOVERY_INTERVAL_MS", recovery_interval_ms)?;

        let host = env_str("HOST", "127.0.0.1");
        let port = parse_int("PORT", env::var("PORT").ok(), 8080)?;
        if !(1..=65_535).contains(&port) {
            return Err(TaskmillError::Config(format!(
                "PORT must be between 1 and 65535, got {port}"
            )));
        }

        let log_level = env_str("LOG_LEVEL", "info").to_lowercase();

        Ok(Settings {
            db_path,
            max_concurrent_tasks: max_concurrent_tasks as usize,
            sched_tick_ms: sched_tick_ms as u64,
            lease_ms,
            max_attempts,
            recovery_interval_ms,
            host,
            port: port as u16,
            log_level,
        })
    }
}

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_int(name: &str, raw: Option<String>, default: i64) -> Result<i64> {
    match raw {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<i64>().map_err(|_| {
            TaskmillError::Config(format!("{name} must be an integer, got {v:?}"))
        }),
    }
}

fn require_positive(name: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(TaskmillError::Config(format!(
            "{name} must be > 0, got {value}"
        )));
    }
    Ok(())
}

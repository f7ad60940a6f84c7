//! Task submission: validation and atomic insertion of single tasks and
//! batches, including batch-internal cycle rejection.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{Result, TaskmillError};
use crate::models::{dep, NewTask, Task, TaskDetail, TaskStatus};
use crate::storage::db::{begin_immediate, finish, retry_once_if_busy};

pub const MAX_ID_LEN: usize = 256;
pub const MAX_TYPE_LEN: usize = 256;
pub const MAX_DURATION_MS: i64 = 86_400_000; // 24h

/// A submitted task definition.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskSpec {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.len() > MAX_ID_LEN {
            return Err(TaskmillError::Validation(format!(
                "id must be 1..={MAX_ID_LEN} bytes"
            )));
        }
        if self.task_type.is_empty() || self.task_type.len() > MAX_TYPE_LEN {
            return Err(TaskmillError::Validation(format!(
                "type must be 1..={MAX_TYPE_LEN} bytes"
            )));
        }
        if !(1..=MAX_DURATION_MS).contains(&self.duration_ms) {
            return Err(TaskmillError::Validation(format!(
                "duration_ms must be 1..={MAX_DURATION_MS}"
            )));
        }
        if let Some(max_attempts) = self.max_attempts {
            if max_attempts <= 0 {
                return Err(TaskmillError::Validation(
                    "max_attempts must be > 0".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for dep_id in &self.dependencies {
            if dep_id == &self.id {
                return Err(TaskmillError::Validation(format!(
                    "task {} cannot depend on itself",
                    self.id
                )));
            }
            if !seen.insert(dep_id.as_str()) {
                return Err(TaskmillError::Validation(format!(
                    "duplicate dependency {dep_id} on task {}",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// Validates and atomically inserts tasks; computes initial `remaining_deps`.
#[derive(Clone)]
pub struct SubmitService {
    pool: SqlitePool,
    default_max_attempts: i64,
}

impl SubmitService {
    pub fn new(pool: SqlitePool, default_max_attempts: i64) -> Self {
        Self {
            pool,
            default_max_attempts,
        }
    }

    /// Insert a single task. Its dependencies must already exist; the new
    /// task is a leaf of the existing DAG, so no cycle check is needed.
    pub async fn submit(&self, spec: &TaskSpec, now_ms: i64) -> Result<TaskDetail> {
        spec.validate()?;
        let max_attempts = spec.max_attempts.unwrap_or(self.default_max_attempts);

        let detail = retry_once_if_busy(|| self.submit_once(spec, max_attempts, now_ms)).await?;
        info!(task_id = %spec.id, deps = spec.dependencies.len(), "task submitted");
        Ok(detail)
    }

    async fn submit_once(
        &self,
        spec: &TaskSpec,
        max_attempts: i64,
        now_ms: i64,
    ) -> Result<TaskDetail> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::submit_tx(&mut conn, spec, max_attempts, now_ms).await;
        finish(&mut conn, result).await
    }

    async fn submit_tx(
        conn: &mut SqliteConnection,
        spec: &TaskSpec,
        max_attempts: i64,
        now_ms: i64,
    ) -> Result<TaskDetail> {
        if Task::exists(&mut *conn, &spec.id).await? {
            return Err(TaskmillError::DuplicateId {
                ids: vec![spec.id.clone()],
            });
        }

        let mut missing = Vec::new();
        let mut remaining_deps = 0;
        for dep_id in &spec.dependencies {
            match Task::find_by_id(&mut *conn, dep_id).await? {
                None => missing.push(dep_id.clone()),
                Some(task) if task.status != TaskStatus::Completed => remaining_deps += 1,
                Some(_) => {}
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(TaskmillError::UnknownDependency { missing });
        }

        Task::insert(
            &mut *conn,
            &NewTask {
                id: &spec.id,
                task_type: &spec.task_type,
                duration_ms: spec.duration_ms,
                remaining_deps,
                max_attempts,
            },
            now_ms,
        )
        .await?;

        for dep_id in &spec.dependencies {
            dep::insert(&mut *conn, &spec.id, dep_id).await?;
        }

        let task = Task::find_by_id(&mut *conn, &spec.id)
            .await?
            .ok_or(TaskmillError::Store(sqlx::Error::RowNotFound))?;
        let mut dependencies = spec.dependencies.clone();
        dependencies.sort();

        Ok(TaskDetail { task, dependencies })
    }

    /// Atomically insert a batch. Dependencies may point at store tasks or at
    /// other members of the batch (in any order); cycles confined to the
    /// batch are rejected. Returns the created ids in input order.
    pub async fn submit_batch(&self, specs: &[TaskSpec], now_ms: i64) -> Result<Vec<String>> {
        if specs.is_empty() {
            return Err(TaskmillError::Validation(
                "batch must not be empty".to_string(),
            ));
        }
        for spec in specs {
            spec.validate()?;
        }

        let mut duplicated: Vec<String> = Vec::new();
        let mut batch_ids: HashSet<&str> = HashSet::with_capacity(specs.len());
        for spec in specs {
            if !batch_ids.insert(spec.id.as_str()) {
                duplicated.push(spec.id.clone());
            }
        }
        if !duplicated.is_empty() {
            duplicated.sort();
            duplicated.dedup();
            return Err(TaskmillError::DuplicateId { ids: duplicated });
        }

        if let Some(cycle_ids) = batch_cycle_members(specs) {
            return Err(TaskmillError::CycleInBatch { ids: cycle_ids });
        }

        let created = retry_once_if_busy(|| {
            self.submit_batch_once(specs, self.default_max_attempts, now_ms)
        })
        .await?;
        info!(count = created.len(), "batch submitted");
        Ok(created)
    }

    async fn submit_batch_once(
        &self,
        specs: &[TaskSpec],
        default_max_attempts: i64,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = Self::submit_batch_tx(&mut conn, specs, default_max_attempts, now_ms).await;
        finish(&mut conn, result).await
    }

    async fn submit_batch_tx(
        conn: &mut SqliteConnection,
        specs: &[TaskSpec],
        default_max_attempts: i64,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        let batch_ids: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();

        let mut existing = Vec::new();
        for spec in specs {
            if Task::exists(&mut *conn, &spec.id).await? {
                existing.push(spec.id.clone());
            }
        }
        if !existing.is_empty() {
            existing.sort();
            return Err(TaskmillError::DuplicateId { ids: existing });
        }

        // Resolve every dependency that points outside the batch once.
        let mut missing = Vec::new();
        let mut incomplete_external: HashSet<&str> = HashSet::new();
        let mut seen_external: HashSet<&str> = HashSet::new();
        for spec in specs {
            for dep_id in &spec.dependencies {
                let dep_id = dep_id.as_str();
                if batch_ids.contains(dep_id) || !seen_external.insert(dep_id) {
                    continue;
                }
                match Task::find_by_id(&mut *conn, dep_id).await? {
                    None => missing.push(dep_id.to_string()),
                    Some(task) if task.status != TaskStatus::Completed => {
                        incomplete_external.insert(dep_id);
                    }
                    Some(_) => {}
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            return Err(TaskmillError::UnknownDependency { missing });
        }

        // Batch members start QUEUED, so a batch-internal dependency always
        // counts toward remaining_deps.
        for spec in specs {
            let remaining_deps = spec
                .dependencies
                .iter()
                .filter(|d| {
                    batch_ids.contains(d.as_str()) || incomplete_external.contains(d.as_str())
                })
                .count() as i64;

            Task::insert(
                &mut *conn,
                &NewTask {
                    id: &spec.id,
                    task_type: &spec.task_type,
                    duration_ms: spec.duration_ms,
                    remaining_deps,
                    max_attempts: spec.max_attempts.unwrap_or(default_max_attempts),
                },
                now_ms,
            )
            .await?;
        }

        for spec in specs {
            for dep_id in &spec.dependencies {
                dep::insert(&mut *conn, &spec.id, dep_id).await?;
            }
        }

        Ok(specs.iter().map(|s| s.id.clone()).collect())
    }
}

/// Kahn's algorithm over the batch-induced subgraph. Edges into pre-existing
/// store tasks cannot close a cycle (those tasks cannot reference ids that do
/// not exist yet) and are ignored. Returns the ids stuck in a cycle, sorted.
fn batch_cycle_members(specs: &[TaskSpec]) -> Option<Vec<String>> {
    let ids: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();

    let mut indegree: HashMap<&str, usize> = specs.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for spec in specs {
        for dep_id in &spec.dependencies {
            if ids.contains(dep_id.as_str()) {
                dependents
                    .entry(dep_id.as_str())
                    .or_default()
                    .push(spec.id.as_str());
                *indegree.entry(spec.id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(node) {
            for &child in children {
                if let Some(degree) = indegree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
    }

    if visited == specs.len() {
        return None;
    }

    let mut cycle: Vec<String> = indegree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    cycle.sort();
    Some(cycle)
}

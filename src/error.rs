//! Error types for the taskmill engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("task id(s) already exist: {ids:?}")]
    DuplicateId { ids: Vec<String> },

    #[error("unknown dependency id(s): {missing:?}")]
    UnknownDependency { missing: Vec<String> },

    #[error("dependency cycle within batch: {ids:?}")]
    CycleInBatch { ids: Vec<String> },

    #[error("task {id} is {status}; expected RUNNING")]
    StateConflict { id: String, status: String },

    #[error("task not found: {id}")]
    NotFound { id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskmillError>;

impl TaskmillError {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TaskmillError::DuplicateId { .. } => "DUPLICATE_ID",
            TaskmillError::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            TaskmillError::CycleInBatch { .. } => "CYCLE_IN_BATCH",
            TaskmillError::StateConflict { .. } => "STATE_CONFLICT",
            TaskmillError::NotFound { .. } => "NOT_FOUND",
            TaskmillError::Validation(_) => "VALIDATION_ERROR",
            TaskmillError::Store(_) => "STORE_ERROR",
            TaskmillError::Config(_) => "CONFIG_ERROR",
            TaskmillError::Io(_) => "IO_ERROR",
        }
    }
}

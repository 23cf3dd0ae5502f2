//! Error types for the simulation pipeline.
//!
//! One enum per layer: executors report [`ExecutorError`], the persistence layer reports
//! [`StoreError`], and the orchestrator folds both into [`PipelineError`].

use thiserror::Error;

use crate::state_machine::PipelineStage;

/// Failures raised by an executor backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// The backend refused the start request.
    #[error("Submission rejected by {endpoint}: {reason}")]
    Submission { endpoint: String, reason: String },

    /// `result()` was called before `is_finished()` reported true.
    #[error("Executor result requested before completion")]
    ResultNotReady,

    /// The subprocess wrote a progress line that is not `<current>/<target>`.
    #[error("Unexpected progress output: {line:?}")]
    MonitoringParse { line: String },

    /// The remote backend could not be reached or answered garbage.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The local subprocess could not be spawned or exited abnormally.
    #[error("Process error: {0}")]
    Process(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ExecutorError {
    pub fn submission(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Submission {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(error: std::io::Error) -> Self {
        ExecutorError::Io(error.to_string())
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(error: reqwest::Error) -> Self {
        ExecutorError::Backend(error.to_string())
    }
}

impl From<russh::Error> for ExecutorError {
    fn from(error: russh::Error) -> Self {
        ExecutorError::Tunnel(error.to_string())
    }
}

/// Failures raised by the persistence layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A second step tried to start while another one is still ONGOING.
    #[error("Simulation {simulation_id} already has ongoing step {step_id}")]
    StepAlreadyOngoing { simulation_id: i64, step_id: i64 },

    #[error("Invalid step transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Database(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(format!("migration failed: {error}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Database(format!("JSON serialization error: {error}"))
    }
}

/// Orchestration-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cooperative cancellation of the named stage.
    #[error("Revocation requested during {stage} stage")]
    Revoked { stage: PipelineStage },

    #[error("Workdir error: {0}")]
    Workdir(String),

    #[error("Report rendering error: {0}")]
    Render(String),

    #[error("{stage} stage produced no artifact to hand over")]
    NoPrimaryArtifact { stage: PipelineStage },

    #[error("Worker pool error: {0}")]
    Queue(String),
}

impl PipelineError {
    pub fn is_revocation(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        PipelineError::Workdir(error.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::Workdir(format!("JSON serialization error: {error}"))
    }
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

//! # Runtime Info
//!
//! Progress and resource snapshots of an in-flight stage. The executor's monitoring task
//! is the only producer; the stage's polling loop reads snapshots and persists them. When
//! the step completes the snapshot is frozen to idle values.

use serde::{Deserialize, Serialize};

use crate::state_machine::PipelineStage;

/// Snapshot of the simulator subprocess
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliRuntimeInfo {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot reported by the analyzer backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerRuntimeInfo {
    #[serde(default)]
    pub progress: f64,
    #[serde(default, alias = "finished")]
    pub is_finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of the report fan-out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRuntimeInfo {
    pub progress: f64,
    pub completed_jobs: usize,
    pub total_jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReportRuntimeInfo {
    pub fn with_jobs(completed_jobs: usize, total_jobs: usize) -> Self {
        let progress = if total_jobs == 0 {
            100.0
        } else {
            completed_jobs as f64 / total_jobs as f64 * 100.0
        };
        Self {
            progress,
            completed_jobs,
            total_jobs,
            error: None,
        }
    }
}

/// Runtime snapshot, shaped by the stage that owns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeInfo {
    Cli(CliRuntimeInfo),
    Analyzer(AnalyzerRuntimeInfo),
    Report(ReportRuntimeInfo),
}

impl RuntimeInfo {
    /// Initial snapshot for a stage.
    ///
    /// Executors are stage-agnostic; the stage decides the shape so a local binary run for
    /// the analyzer still reports analyzer-shaped progress.
    pub fn initial(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Analyzer => Self::Analyzer(AnalyzerRuntimeInfo::default()),
            PipelineStage::Report => Self::Report(ReportRuntimeInfo::default()),
            _ => Self::Cli(CliRuntimeInfo::default()),
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            Self::Cli(info) => info.progress,
            Self::Analyzer(info) => info.progress,
            Self::Report(info) => info.progress,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Cli(info) => info.error.as_deref(),
            Self::Analyzer(info) => info.error.as_deref(),
            Self::Report(info) => info.error.as_deref(),
        }
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        let error = Some(error.into());
        match self {
            Self::Cli(info) => info.error = error,
            Self::Analyzer(info) => info.error = error,
            Self::Report(info) => info.error = error,
        }
    }

    /// Overwrite the progress percentage, keeping resource readings
    pub fn set_progress(&mut self, progress: f64) {
        match self {
            Self::Cli(info) => info.progress = progress,
            Self::Analyzer(info) => info.progress = progress,
            Self::Report(info) => info.progress = progress,
        }
    }

    /// Idle values recorded once the step is done: no resource usage, full progress
    pub fn frozen(&self) -> Self {
        match self {
            Self::Cli(info) => Self::Cli(CliRuntimeInfo {
                cpu_percent: 0.0,
                memory_bytes: 0,
                progress: 100.0,
                error: info.error.clone(),
            }),
            Self::Analyzer(info) => Self::Analyzer(AnalyzerRuntimeInfo {
                progress: 100.0,
                is_finished: true,
                error: info.error.clone(),
            }),
            Self::Report(info) => Self::Report(ReportRuntimeInfo {
                progress: 100.0,
                completed_jobs: info.total_jobs,
                total_jobs: info.total_jobs,
                error: info.error.clone(),
            }),
        }
    }

    /// Reshape a snapshot coming from an executor into the stage's own variant
    pub fn reshape_for(self, stage: PipelineStage) -> Self {
        match (stage, self) {
            (PipelineStage::Analyzer, Self::Cli(info)) => Self::Analyzer(AnalyzerRuntimeInfo {
                progress: info.progress,
                is_finished: false,
                error: info.error,
            }),
            (PipelineStage::Cli, Self::Analyzer(info)) => Self::Cli(CliRuntimeInfo {
                progress: info.progress,
                error: info.error,
                ..CliRuntimeInfo::default()
            }),
            (_, info) => info,
        }
    }
}

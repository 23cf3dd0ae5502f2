//! # Step Model
//!
//! A step records one stage execution for a simulation: when it ran, which stage it
//! belongs to (`origin`), its status and the handle of the worker-pool task executing it.
//! At most one step per simulation is ONGOING at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Artifact, RuntimeInfo};
use crate::state_machine::{PipelineStage, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: i64,
    pub simulation_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub origin: PipelineStage,
    pub status: StepStatus,
    pub error_message: Option<String>,
    /// Worker-pool task handle, used for revocation and lookup
    pub task_handle: Option<String>,
}

impl Step {
    pub fn is_ongoing(&self) -> bool {
        self.status.is_active()
    }
}

/// A step together with everything it owns, as returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetails {
    #[serde(flatten)]
    pub step: Step,
    pub artifacts: Vec<Artifact>,
    pub runtime_info: Option<RuntimeInfo>,
}

//! # Simulation Model
//!
//! One run of the pipeline. The simulation owns its steps and artifacts; both are removed
//! with it. `current_step`/`current_step_id` always point at the most recently started
//! step and `finished_at` is set once the REPORT stage hands over to FINISHED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::PipelineStage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub simulation_id: i64,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_step: PipelineStage,
    pub current_step_id: Option<i64>,
    pub workdir: Option<String>,
}

impl Simulation {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Parameters for creating a simulation together with its first step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSimulation {
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Origin of the step created alongside the simulation
    pub initial_stage: PipelineStage,
}

impl NewSimulation {
    pub fn new(name: impl Into<String>, initial_stage: PipelineStage) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            initial_stage,
        }
    }
}

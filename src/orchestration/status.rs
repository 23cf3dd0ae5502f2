//! Read-only views over the store for status queries.

use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::models::{Simulation, StepDetails};
use crate::state_machine::PipelineStage;
use crate::store::PipelineStore;

/// Whether any simulation is currently running a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Busy {
        simulation_id: i64,
        current_step: PipelineStage,
    },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStatus {
    #[serde(flatten)]
    pub simulation: Simulation,
    pub steps: Vec<StepDetails>,
}

pub async fn pipeline_status(store: &dyn PipelineStore) -> PipelineResult<PipelineStatus> {
    Ok(match store.current_simulation().await? {
        Some(simulation) => PipelineStatus::Busy {
            simulation_id: simulation.simulation_id,
            current_step: simulation.current_step,
        },
        None => PipelineStatus::Idle,
    })
}

pub async fn step_status(store: &dyn PipelineStore, step_id: i64) -> PipelineResult<StepDetails> {
    let step = store.step(step_id).await?;
    let artifacts = store.artifacts_for_step(step_id).await?;
    let runtime_info = store.runtime_info(step_id).await?;
    Ok(StepDetails {
        step,
        artifacts,
        runtime_info,
    })
}

pub async fn simulation_status(
    store: &dyn PipelineStore,
    simulation_id: i64,
) -> PipelineResult<SimulationStatus> {
    let simulation = store.simulation(simulation_id).await?;
    let mut steps = Vec::new();
    for step in store.steps_for_simulation(simulation_id).await? {
        steps.push(step_status(store, step.step_id).await?);
    }
    Ok(SimulationStatus { simulation, steps })
}

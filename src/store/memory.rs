//! In-memory pipeline store.
//!
//! All tables live behind one `parking_lot::RwLock`; each operation takes the write lock
//! once, validates everything first and only then mutates, so a failed operation leaves
//! no partial writes behind.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::PipelineStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{Artifact, NewArtifact, NewSimulation, RuntimeInfo, Simulation, Step};
use crate::state_machine::{PipelineStage, StepEvent, StepStateMachine, StepStatus};

#[derive(Debug, Default)]
struct Tables {
    simulations: BTreeMap<i64, Simulation>,
    steps: BTreeMap<i64, Step>,
    artifacts: BTreeMap<i64, Artifact>,
    runtime_info: HashMap<i64, RuntimeInfo>,
    last_simulation_id: i64,
    last_step_id: i64,
    last_artifact_id: i64,
}

impl Tables {
    fn simulation(&self, simulation_id: i64) -> StoreResult<&Simulation> {
        self.simulations
            .get(&simulation_id)
            .ok_or_else(|| StoreError::not_found("simulation", simulation_id))
    }

    fn step(&self, step_id: i64) -> StoreResult<&Step> {
        self.steps
            .get(&step_id)
            .ok_or_else(|| StoreError::not_found("step", step_id))
    }

    fn ongoing_step(&self, simulation_id: i64) -> Option<&Step> {
        self.steps
            .values()
            .find(|step| step.simulation_id == simulation_id && step.is_ongoing())
    }

    fn insert_step(&mut self, simulation_id: i64, origin: PipelineStage) -> Step {
        self.last_step_id += 1;
        let step = Step {
            step_id: self.last_step_id,
            simulation_id,
            started_at: Utc::now(),
            finished_at: None,
            origin,
            status: StepStatus::Ongoing,
            error_message: None,
            task_handle: None,
        };
        self.steps.insert(step.step_id, step.clone());
        step
    }

    fn insert_artifacts(&mut self, step: &Step, artifacts: Vec<NewArtifact>) -> Vec<Artifact> {
        artifacts
            .into_iter()
            .map(|artifact| {
                self.last_artifact_id += 1;
                let artifact = artifact
                    .for_step(step.simulation_id, step.step_id)
                    .into_artifact(self.last_artifact_id);
                self.artifacts.insert(artifact.artifact_id, artifact.clone());
                artifact
            })
            .collect()
    }

    /// Apply a terminal event to a step, returning the updated record
    fn close_step(
        &mut self,
        step_id: i64,
        event: &StepEvent,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Step> {
        let current = self.step(step_id)?.status;
        let target = StepStateMachine::transition(current, event)?;

        if let Some(info) = final_runtime_info {
            self.runtime_info.insert(step_id, info);
        }

        let step = self
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::not_found("step", step_id))?;
        step.status = target;
        step.finished_at = Some(Utc::now());
        step.error_message = event.error_message().map(str::to_string);
        Ok(step.clone())
    }
}

/// Process-local store, used by tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn create_simulation(
        &self,
        new_simulation: NewSimulation,
    ) -> StoreResult<(Simulation, Step)> {
        let mut tables = self.tables.write();
        tables.last_simulation_id += 1;
        let simulation_id = tables.last_simulation_id;

        let mut step = tables.insert_step(simulation_id, new_simulation.initial_stage);
        step.started_at = new_simulation.started_at;
        tables.steps.insert(step.step_id, step.clone());

        let simulation = Simulation {
            simulation_id,
            name: new_simulation.name,
            started_at: new_simulation.started_at,
            finished_at: None,
            current_step: new_simulation.initial_stage,
            current_step_id: Some(step.step_id),
            workdir: None,
        };
        tables.simulations.insert(simulation_id, simulation.clone());

        Ok((simulation, step))
    }

    async fn register_configuration(
        &self,
        simulation_id: i64,
        workdir: &str,
        artifact: NewArtifact,
    ) -> StoreResult<Artifact> {
        let mut tables = self.tables.write();
        let step_id = tables
            .simulation(simulation_id)?
            .current_step_id
            .ok_or_else(|| StoreError::not_found("step for simulation", simulation_id))?;
        let step = tables.step(step_id)?.clone();

        let mut persisted = tables.insert_artifacts(&step, vec![artifact]);
        if let Some(simulation) = tables.simulations.get_mut(&simulation_id) {
            simulation.workdir = Some(workdir.to_string());
        }

        persisted.pop().ok_or_else(|| {
            StoreError::Database("configuration artifact was not stored".to_string())
        })
    }

    async fn begin_step(
        &self,
        simulation_id: i64,
        origin: PipelineStage,
        initial: RuntimeInfo,
    ) -> StoreResult<Step> {
        let mut tables = self.tables.write();
        tables.simulation(simulation_id)?;

        let step = match tables.ongoing_step(simulation_id) {
            Some(ongoing) if ongoing.origin == origin => ongoing.clone(),
            Some(ongoing) => {
                return Err(StoreError::StepAlreadyOngoing {
                    simulation_id,
                    step_id: ongoing.step_id,
                })
            }
            None => tables.insert_step(simulation_id, origin),
        };

        tables.runtime_info.insert(step.step_id, initial);
        if let Some(simulation) = tables.simulations.get_mut(&simulation_id) {
            simulation.current_step = origin;
            simulation.current_step_id = Some(step.step_id);
        }

        Ok(step)
    }

    async fn set_task_handle(&self, step_id: i64, task_handle: &str) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let step = tables
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::not_found("step", step_id))?;
        step.task_handle = Some(task_handle.to_string());
        Ok(())
    }

    async fn update_runtime_info(
        &self,
        step_id: i64,
        runtime_info: &RuntimeInfo,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        tables.step(step_id)?;
        tables.runtime_info.insert(step_id, runtime_info.clone());
        Ok(())
    }

    async fn complete_step(
        &self,
        step_id: i64,
        artifacts: Vec<NewArtifact>,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Vec<Artifact>> {
        let mut tables = self.tables.write();
        let step = tables.close_step(step_id, &StepEvent::Complete, final_runtime_info)?;
        Ok(tables.insert_artifacts(&step, artifacts))
    }

    async fn fail_step(
        &self,
        step_id: i64,
        error_message: &str,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Step> {
        let mut tables = self.tables.write();
        tables.close_step(
            step_id,
            &StepEvent::fail_with_error(error_message),
            final_runtime_info,
        )
    }

    async fn finish_simulation(&self, simulation_id: i64) -> StoreResult<Simulation> {
        let mut tables = self.tables.write();
        let simulation = tables
            .simulations
            .get_mut(&simulation_id)
            .ok_or_else(|| StoreError::not_found("simulation", simulation_id))?;
        simulation.finished_at = Some(Utc::now());
        simulation.current_step = PipelineStage::Finished;
        Ok(simulation.clone())
    }

    async fn simulation(&self, simulation_id: i64) -> StoreResult<Simulation> {
        self.tables.read().simulation(simulation_id).cloned()
    }

    async fn step(&self, step_id: i64) -> StoreResult<Step> {
        self.tables.read().step(step_id).cloned()
    }

    async fn artifact(&self, artifact_id: i64) -> StoreResult<Artifact> {
        self.tables
            .read()
            .artifacts
            .get(&artifact_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("artifact", artifact_id))
    }

    async fn steps_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Step>> {
        let tables = self.tables.read();
        tables.simulation(simulation_id)?;
        Ok(tables
            .steps
            .values()
            .filter(|step| step.simulation_id == simulation_id)
            .cloned()
            .collect())
    }

    async fn artifacts_for_step(&self, step_id: i64) -> StoreResult<Vec<Artifact>> {
        let tables = self.tables.read();
        tables.step(step_id)?;
        Ok(tables
            .artifacts
            .values()
            .filter(|artifact| artifact.step_id == step_id)
            .cloned()
            .collect())
    }

    async fn artifacts_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Artifact>> {
        let tables = self.tables.read();
        tables.simulation(simulation_id)?;
        Ok(tables
            .artifacts
            .values()
            .filter(|artifact| artifact.simulation_id == simulation_id)
            .cloned()
            .collect())
    }

    async fn runtime_info(&self, step_id: i64) -> StoreResult<Option<RuntimeInfo>> {
        let tables = self.tables.read();
        tables.step(step_id)?;
        Ok(tables.runtime_info.get(&step_id).cloned())
    }

    async fn current_simulation(&self) -> StoreResult<Option<Simulation>> {
        let tables = self.tables.read();
        Ok(tables
            .simulations
            .values()
            .rev()
            .find(|simulation| tables.ongoing_step(simulation.simulation_id).is_some())
            .cloned())
    }

    async fn latest_simulation(&self) -> StoreResult<Option<Simulation>> {
        Ok(self.tables.read().simulations.values().next_back().cloned())
    }
}

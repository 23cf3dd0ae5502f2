//! # Pipeline Store
//!
//! Persistence for simulations, steps, artifacts and runtime snapshots.
//!
//! Every operation that touches more than one record runs inside a single transaction of
//! the backing store, so concurrent stages of different simulations never observe each
//! other's partial writes. Step status changes are validated by the
//! [`StepStateMachine`](crate::state_machine::StepStateMachine) and at most one step per
//! simulation can be ONGOING.
//!
//! Two implementations ship with the crate:
//! - [`InMemoryStore`]: process-local tables behind a `parking_lot::RwLock`
//! - [`PgStore`]: Postgres through `sqlx`, schema in `migrations/`

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Artifact, NewArtifact, NewSimulation, RuntimeInfo, Simulation, Step};
use crate::state_machine::PipelineStage;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Create a simulation together with its first ONGOING step
    async fn create_simulation(
        &self,
        new_simulation: NewSimulation,
    ) -> StoreResult<(Simulation, Step)>;

    /// Record the simulation workdir and attach the configuration artifact to the
    /// simulation's current step
    async fn register_configuration(
        &self,
        simulation_id: i64,
        workdir: &str,
        artifact: NewArtifact,
    ) -> StoreResult<Artifact>;

    /// Start (or adopt) the step for `origin` and point the simulation at it.
    ///
    /// An ONGOING step with the same origin is reused; an ONGOING step of another origin is
    /// rejected with `StepAlreadyOngoing`. The step's runtime snapshot is reset to `initial`.
    async fn begin_step(
        &self,
        simulation_id: i64,
        origin: PipelineStage,
        initial: RuntimeInfo,
    ) -> StoreResult<Step>;

    async fn set_task_handle(&self, step_id: i64, task_handle: &str) -> StoreResult<()>;

    async fn update_runtime_info(
        &self,
        step_id: i64,
        runtime_info: &RuntimeInfo,
    ) -> StoreResult<()>;

    /// Persist the step's artifacts and mark it SUCCESS
    async fn complete_step(
        &self,
        step_id: i64,
        artifacts: Vec<NewArtifact>,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Vec<Artifact>>;

    /// Mark the step FAILURE with an error message
    async fn fail_step(
        &self,
        step_id: i64,
        error_message: &str,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Step>;

    /// Set `finished_at` and move the simulation to FINISHED
    async fn finish_simulation(&self, simulation_id: i64) -> StoreResult<Simulation>;

    async fn simulation(&self, simulation_id: i64) -> StoreResult<Simulation>;

    async fn step(&self, step_id: i64) -> StoreResult<Step>;

    async fn artifact(&self, artifact_id: i64) -> StoreResult<Artifact>;

    /// Steps of a simulation in start order
    async fn steps_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Step>>;

    async fn artifacts_for_step(&self, step_id: i64) -> StoreResult<Vec<Artifact>>;

    async fn artifacts_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Artifact>>;

    async fn runtime_info(&self, step_id: i64) -> StoreResult<Option<RuntimeInfo>>;

    /// Most recent simulation that has an ONGOING step
    async fn current_simulation(&self) -> StoreResult<Option<Simulation>>;

    async fn latest_simulation(&self) -> StoreResult<Option<Simulation>>;
}

//! # Orchestration
//!
//! The per-simulation stage chain and everything it runs on:
//!
//! - [`workdir`]: CONF stage, creates the simulation, its workdir and configuration artifact
//! - [`stage`]: CLI and ANALYZER stages, each driving one executor to completion
//! - [`report`]: REPORT stage, parallel plot rendering followed by report assembly
//! - [`worker_pool`]: in-process task queue with handles, lookup and revocation
//! - [`cancellation`]: the stage chain and the revocation guard that truncates it
//! - [`pipeline`]: the [`Orchestrator`] tying the stages together
//! - [`status`]: BUSY/IDLE and per-simulation status queries

pub mod cancellation;
pub mod pipeline;
pub mod report;
pub mod stage;
pub mod status;
pub mod workdir;
pub mod worker_pool;

pub use cancellation::{RevocationGuard, StageChain};
pub use pipeline::{ChainOutcome, Orchestrator, SimulationRun};
pub use report::{CommandRenderer, ReportRenderer, ReportStage};
pub use stage::{ExecutorStage, StageContext};
pub use status::{PipelineStatus, SimulationStatus};
pub use workdir::{setup_simulation, SimulationRequest, SimulationSetup};
pub use worker_pool::{TaskContext, TaskHandle, TaskInfo, TaskQueue, TaskState};

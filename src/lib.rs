#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # SIMBAD Pipeline
//!
//! Orchestration core for the SIMBAD simulation pipeline.
//!
//! ## Overview
//!
//! A simulation moves through a strictly linear chain of stages:
//!
//! ```text
//! CONF -> CLI -> ANALYZER -> REPORT -> FINISHED
//! ```
//!
//! Each stage records a step, hands its input artifact to an executor, persists runtime
//! snapshots while the executor works and finally records the produced artifacts. The
//! primary artifact of one stage is the input of the next.
//!
//! ## Module Organization
//!
//! - [`models`] - simulations, steps, artifacts and runtime snapshots
//! - [`store`] - transactional persistence (in-memory and Postgres)
//! - [`state_machine`] - pipeline stages and step status transitions
//! - [`executor`] - local subprocess, HTTP and SSH-tunneled HTTP executors
//! - [`monitor`] - background progress sampling
//! - [`orchestration`] - stages, worker pool, revocation and the orchestrator
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging setup
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use simbad_pipeline::config::ConfigManager;
//! use simbad_pipeline::orchestration::{Orchestrator, SimulationRequest};
//! use simbad_pipeline::store::InMemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let orchestrator = Orchestrator::with_command_renderer(
//!     manager.config().clone(),
//!     Arc::new(InMemoryStore::new()),
//! );
//!
//! let outcome = orchestrator
//!     .run(SimulationRequest {
//!         configuration_name: "demo".to_string(),
//!         configuration: serde_json::json!({"parameters": {"mutations": 3}}),
//!         name: None,
//!     })
//!     .await?;
//! println!("simulation {} ended after {:?}", outcome.simulation_id, outcome.completed_stages);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod orchestration;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, ExecutorKind, PipelineConfig};
pub use error::{ExecutorError, PipelineError, PipelineResult, StoreError};
pub use executor::{Executor, ExecutorOutput, StageExecutor};
pub use models::{Artifact, FileType, RuntimeInfo, Simulation, Step};
pub use orchestration::{ChainOutcome, Orchestrator, SimulationRequest};
pub use state_machine::{PipelineStage, StepStatus};
pub use store::{InMemoryStore, PgStore, PipelineStore};

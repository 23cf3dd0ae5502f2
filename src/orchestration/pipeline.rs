//! # Pipeline Orchestrator
//!
//! Drives each simulation through `CONF → CLI → ANALYZER → REPORT → FINISHED`.
//!
//! Setup (CONF) runs inline in [`Orchestrator::submit`]; every later stage is submitted to
//! the [`TaskQueue`] only after the previous stage's records are persisted, and receives
//! the previous stage's primary artifact id as its input. All stage tasks of a simulation
//! share one parent cancellation token, so revoking the simulation (or any one of its
//! stage tasks) stops the chain at the next check.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::PipelineConfig;
use crate::constants::tasks;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::{log_error, log_simulation_operation};
use crate::models::StepDetails;
use crate::orchestration::cancellation::{RevocationGuard, StageChain};
use crate::orchestration::report::{CommandRenderer, ReportRenderer, ReportStage};
use crate::orchestration::stage::{ExecutorStage, StageContext};
use crate::orchestration::status::{self, PipelineStatus, SimulationStatus};
use crate::orchestration::workdir::{setup_simulation, SimulationRequest};
use crate::orchestration::worker_pool::{TaskHandle, TaskInfo, TaskQueue};
use crate::state_machine::PipelineStage;
use crate::store::PipelineStore;

/// How a simulation's chain ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainOutcome {
    pub simulation_id: i64,
    pub completed_stages: Vec<PipelineStage>,
    /// Stage that observed the revocation, if the chain was revoked
    pub revoked_at: Option<PipelineStage>,
    /// Primary artifact of the last completed stage
    pub final_artifact_id: Option<i64>,
}

impl ChainOutcome {
    fn new(simulation_id: i64) -> Self {
        Self {
            simulation_id,
            completed_stages: vec![PipelineStage::Conf],
            revoked_at: None,
            final_artifact_id: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_stages.last() == Some(&PipelineStage::Finished)
    }
}

/// A submitted simulation whose chain is running in the background
#[derive(Debug)]
pub struct SimulationRun {
    pub simulation_id: i64,
    pub configuration_artifact_id: i64,
    pub join: JoinHandle<PipelineResult<ChainOutcome>>,
}

impl SimulationRun {
    pub async fn wait(self) -> PipelineResult<ChainOutcome> {
        self.join
            .await
            .map_err(|e| PipelineError::Queue(format!("chain task failed: {e}")))?
    }
}

struct OrchestratorInner {
    config: PipelineConfig,
    store: Arc<dyn PipelineStore>,
    renderer: Arc<dyn ReportRenderer>,
    queue: TaskQueue,
    chains: DashMap<i64, CancellationToken>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PipelineStore>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Self {
        let queue = TaskQueue::new(config.worker_pool.max_concurrent_tasks)
            .with_retention(config.worker_pool.task_retention());
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                renderer,
                queue,
                chains: DashMap::new(),
            }),
        }
    }

    /// Orchestrator rendering reports with the configured external command
    pub fn with_command_renderer(config: PipelineConfig, store: Arc<dyn PipelineStore>) -> Self {
        let renderer = Arc::new(CommandRenderer::new(config.report.renderer_command.clone()));
        Self::new(config, store, renderer)
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.inner.store
    }

    /// Set up the simulation and dispatch its chain
    #[instrument(skip(self, request), fields(configuration = %request.configuration_name))]
    pub async fn submit(&self, request: SimulationRequest) -> PipelineResult<SimulationRun> {
        let setup = setup_simulation(
            self.inner.store.as_ref(),
            &self.inner.config.data_path,
            request,
        )
        .await?;

        let simulation_id = setup.simulation.simulation_id;
        let configuration_artifact_id = setup.configuration.artifact_id;
        let token = CancellationToken::new();
        self.inner.chains.insert(simulation_id, token.clone());

        let inner = self.inner.clone();
        let join = tokio::spawn(async move {
            let outcome = inner
                .drive(simulation_id, configuration_artifact_id, &token)
                .await;
            inner.chains.remove(&simulation_id);
            outcome
        });

        Ok(SimulationRun {
            simulation_id,
            configuration_artifact_id,
            join,
        })
    }

    /// Submit and wait for the chain to end
    pub async fn run(&self, request: SimulationRequest) -> PipelineResult<ChainOutcome> {
        self.submit(request).await?.wait().await
    }

    /// Revoke every stage of a running simulation. Returns `false` when no chain is running.
    pub fn revoke_simulation(&self, simulation_id: i64) -> bool {
        match self.inner.chains.get(&simulation_id) {
            Some(token) => {
                log_simulation_operation("revoke", Some(simulation_id), None, "requested", None);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Revoke one stage task by its handle; the chain stops after that stage
    pub fn revoke_task(&self, handle: &TaskHandle) -> bool {
        self.inner.queue.revoke(handle)
    }

    pub fn task_info(&self, handle: &TaskHandle) -> Option<TaskInfo> {
        self.inner.queue.lookup(handle)
    }

    pub fn is_running(&self, simulation_id: i64) -> bool {
        self.inner.chains.contains_key(&simulation_id)
    }

    pub async fn pipeline_status(&self) -> PipelineResult<PipelineStatus> {
        status::pipeline_status(self.inner.store.as_ref()).await
    }

    pub async fn simulation_status(&self, simulation_id: i64) -> PipelineResult<SimulationStatus> {
        status::simulation_status(self.inner.store.as_ref(), simulation_id).await
    }

    pub async fn step_status(&self, step_id: i64) -> PipelineResult<StepDetails> {
        status::step_status(self.inner.store.as_ref(), step_id).await
    }
}

impl OrchestratorInner {
    async fn drive(
        self: &Arc<Self>,
        simulation_id: i64,
        configuration_artifact_id: i64,
        token: &CancellationToken,
    ) -> PipelineResult<ChainOutcome> {
        let mut chain = StageChain::after(PipelineStage::Conf);
        let guard = RevocationGuard::new(None::<i64>);
        let mut outcome = ChainOutcome::new(simulation_id);
        let mut input = configuration_artifact_id;

        while let Some(stage) = chain.dispatch_next() {
            if stage == PipelineStage::Finished {
                let simulation = self.store.finish_simulation(simulation_id).await?;
                outcome.completed_stages.push(PipelineStage::Finished);
                log_simulation_operation(
                    "finish",
                    Some(simulation_id),
                    Some(&simulation.name),
                    "finished",
                    None,
                );
                break;
            }

            let join = self.dispatch(stage, simulation_id, input, token)?;
            let result = guard
                .run(&mut chain, async move {
                    join.await
                        .map_err(|e| PipelineError::Queue(format!("{stage} task failed: {e}")))?
                })
                .await;

            match result {
                Ok(Some(artifact_id)) => {
                    outcome.completed_stages.push(stage);
                    outcome.final_artifact_id = Some(artifact_id);
                    input = artifact_id;
                }
                Ok(None) => {
                    outcome.revoked_at = Some(stage);
                    log_simulation_operation(
                        "revoke",
                        Some(simulation_id),
                        None,
                        "revoked",
                        Some(stage.as_str()),
                    );
                }
                Err(error) => {
                    log_error("orchestrator", stage.as_str(), &error.to_string(), None);
                    return Err(error);
                }
            }
        }

        info!(
            simulation_id,
            stages = ?outcome.completed_stages,
            revoked_at = ?outcome.revoked_at,
            "Simulation chain ended"
        );
        Ok(outcome)
    }

    fn dispatch(
        self: &Arc<Self>,
        stage: PipelineStage,
        simulation_id: i64,
        input: i64,
        parent: &CancellationToken,
    ) -> PipelineResult<JoinHandle<PipelineResult<Option<i64>>>> {
        let (name, executor_config) = match stage {
            PipelineStage::Cli => (tasks::CLI, Some(self.config.cli.clone())),
            PipelineStage::Analyzer => (tasks::ANALYZER, Some(self.config.analyzer.clone())),
            PipelineStage::Report => (tasks::REPORT, None),
            other => {
                return Err(PipelineError::Queue(format!(
                    "{other} is not a dispatchable stage"
                )));
            }
        };

        let inner = self.clone();
        let (_, join) = self.queue.submit_with_parent(name, parent, move |ctx| async move {
            ctx.set_meta(json!({
                "simulation_id": simulation_id,
                "stage": stage.as_str(),
                "input_artifact_id": input,
            }));
            let cancel = ctx.cancellation_token().clone();
            let artifact_id = match executor_config {
                Some(config) => {
                    let context = StageContext::new(simulation_id, input, cancel)
                        .with_task_handle(ctx.handle());
                    ExecutorStage::new(stage, config, inner.store.clone())
                        .run(context)
                        .await?
                }
                None => {
                    ReportStage::new(
                        inner.store.clone(),
                        inner.renderer.clone(),
                        inner.config.report.clone(),
                    )
                    .run(simulation_id, cancel, Some(ctx.handle()))
                    .await?
                }
            };
            Ok(Some(artifact_id))
        });
        Ok(join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_revoke_unknown_simulation() {
        let orchestrator = Orchestrator::with_command_renderer(
            PipelineConfig::default(),
            Arc::new(InMemoryStore::new()),
        );
        assert!(!orchestrator.revoke_simulation(42));
        assert!(!orchestrator.is_running(42));
        assert_eq!(orchestrator.pipeline_status().await.unwrap(), PipelineStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator =
            Orchestrator::with_command_renderer(PipelineConfig::default(), store.clone());
        let request = SimulationRequest {
            configuration_name: "../escape".to_string(),
            configuration: json!({}),
            name: None,
        };

        assert!(orchestrator.submit(request).await.is_err());
        assert!(store.latest_simulation().await.unwrap().is_none());
    }

    #[test]
    fn test_chain_outcome_finished() {
        let mut outcome = ChainOutcome::new(1);
        assert!(!outcome.is_finished());
        outcome.completed_stages.push(PipelineStage::Finished);
        assert!(outcome.is_finished());
    }
}

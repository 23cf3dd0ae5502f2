//! # Executor-backed stages
//!
//! Runs one CLI or ANALYZER stage end to end: start (or adopt) the step, hand the input
//! artifact to the configured executor, persist runtime snapshots at the polling period
//! until the executor finishes, then record the outcome. Revocation is checked between
//! polls; a revoked stage marks its step FAILURE with the message `revoked` and leaves any
//! backend work running.
//!
//! Cleanup always runs once the executor was started, and its errors are logged rather
//! than returned.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::StageExecutorConfig;
use crate::constants::REVOKED_MESSAGE;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{Executor, StageExecutor};
use crate::logging::{log_error, log_step_operation};
use crate::models::{RuntimeInfo, Step};
use crate::orchestration::worker_pool::TaskHandle;
use crate::state_machine::PipelineStage;
use crate::store::PipelineStore;

/// Inputs of one stage invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub simulation_id: i64,
    /// Primary artifact produced by the previous stage
    pub input_artifact_id: i64,
    pub cancel: CancellationToken,
    pub task_handle: Option<TaskHandle>,
}

impl StageContext {
    pub fn new(simulation_id: i64, input_artifact_id: i64, cancel: CancellationToken) -> Self {
        Self {
            simulation_id,
            input_artifact_id,
            cancel,
            task_handle: None,
        }
    }

    pub fn with_task_handle(mut self, task_handle: TaskHandle) -> Self {
        self.task_handle = Some(task_handle);
        self
    }
}

pub struct ExecutorStage {
    stage: PipelineStage,
    config: StageExecutorConfig,
    store: Arc<dyn PipelineStore>,
}

impl ExecutorStage {
    pub fn new(
        stage: PipelineStage,
        config: StageExecutorConfig,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        Self { stage, config, store }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Run the stage with the executor selected by configuration. Returns the id of the
    /// primary artifact for the next stage.
    pub async fn run(&self, context: StageContext) -> PipelineResult<i64> {
        let executor = match StageExecutor::from_config(&self.config) {
            Ok(executor) => executor,
            Err(error) => {
                let error = PipelineError::from(error);
                self.release_adoptable_step(context.simulation_id, &error.to_string()).await?;
                return Err(error);
            }
        };
        self.run_with(executor, context).await
    }

    #[instrument(
        skip(self, executor, context),
        fields(stage = %self.stage, simulation_id = context.simulation_id)
    )]
    pub async fn run_with<E: Executor>(
        &self,
        mut executor: E,
        context: StageContext,
    ) -> PipelineResult<i64> {
        if context.cancel.is_cancelled() {
            self.release_adoptable_step(context.simulation_id, REVOKED_MESSAGE).await?;
            return Err(PipelineError::Revoked { stage: self.stage });
        }

        let input = match self.store.artifact(context.input_artifact_id).await {
            Ok(input) => input,
            Err(error) => {
                let error = PipelineError::from(error);
                self.release_adoptable_step(context.simulation_id, &error.to_string()).await?;
                return Err(error);
            }
        };
        let step = self
            .store
            .begin_step(context.simulation_id, self.stage, RuntimeInfo::initial(self.stage))
            .await?;
        if let Some(handle) = context.task_handle {
            if let Err(error) = self
                .store
                .set_task_handle(step.step_id, &handle.to_string())
                .await
            {
                let error = PipelineError::from(error);
                self.fail(&step, &error.to_string(), None).await?;
                return Err(error);
            }
        }
        log_step_operation(
            "begin",
            Some(step.simulation_id),
            Some(step.step_id),
            Some(self.stage.as_str()),
            "ongoing",
            Some(executor.kind().as_str()),
        );

        if let Err(error) = executor.execute(&input).await {
            let error = PipelineError::from(error);
            self.fail(&step, &error.to_string(), Some(executor.status())).await?;
            cleanup(&mut executor).await;
            return Err(error);
        }

        let polling_period = self.config.polling_period();
        if let Err(error) = self
            .follow(&mut executor, &step, &context.cancel, polling_period)
            .await
        {
            cleanup(&mut executor).await;
            return Err(error);
        }

        let outcome = self.finish(&executor, &step).await;
        cleanup(&mut executor).await;
        outcome
    }

    /// Persist snapshots until the executor reports completion or the stage is revoked
    async fn follow<E: Executor>(
        &self,
        executor: &mut E,
        step: &Step,
        cancel: &CancellationToken,
        polling_period: Duration,
    ) -> PipelineResult<()> {
        while !executor.is_finished() {
            let snapshot = executor.status().reshape_for(self.stage);
            if let Err(error) = self.store.update_runtime_info(step.step_id, &snapshot).await {
                warn!(step_id = step.step_id, error = %error, "Failed to persist runtime info");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let snapshot = executor.status().reshape_for(self.stage);
                    self.fail(step, REVOKED_MESSAGE, Some(snapshot)).await?;
                    return Err(PipelineError::Revoked { stage: self.stage });
                }
                _ = tokio::time::sleep(polling_period) => {}
            }
        }
        debug!(step_id = step.step_id, "Executor finished");
        Ok(())
    }

    async fn finish<E: Executor>(&self, executor: &E, step: &Step) -> PipelineResult<i64> {
        let snapshot = executor.status().reshape_for(self.stage);

        let output = match executor.result() {
            Ok(output) => output,
            Err(error) => {
                let error = PipelineError::from(error);
                self.fail(step, &error.to_string(), Some(snapshot)).await?;
                return Err(error);
            }
        };

        if output.is_empty() {
            let error = PipelineError::NoPrimaryArtifact { stage: self.stage };
            self.fail(step, &error.to_string(), Some(snapshot)).await?;
            return Err(error);
        }

        let artifacts = self
            .store
            .complete_step(step.step_id, output.into_artifacts(), Some(snapshot.frozen()))
            .await?;
        let primary = artifacts
            .first()
            .map(|artifact| artifact.artifact_id)
            .ok_or(PipelineError::NoPrimaryArtifact { stage: self.stage })?;

        log_step_operation(
            "complete",
            Some(step.simulation_id),
            Some(step.step_id),
            Some(self.stage.as_str()),
            "success",
            Some(&format!("{} artifact(s)", artifacts.len())),
        );
        Ok(primary)
    }

    /// A stage that stops before it starts still closes the ONGOING step setup created for it
    async fn release_adoptable_step(
        &self,
        simulation_id: i64,
        message: &str,
    ) -> PipelineResult<()> {
        let pending = self
            .store
            .steps_for_simulation(simulation_id)
            .await?
            .into_iter()
            .find(|step| step.origin == self.stage && step.is_ongoing());
        if let Some(step) = pending {
            self.fail(&step, message, None).await?;
        }
        Ok(())
    }

    async fn fail(
        &self,
        step: &Step,
        message: &str,
        snapshot: Option<RuntimeInfo>,
    ) -> PipelineResult<()> {
        let snapshot = snapshot.map(|mut info| {
            if info.error().is_none() {
                info.set_error(message);
            }
            info
        });
        self.store.fail_step(step.step_id, message, snapshot).await?;
        log_step_operation(
            "fail",
            Some(step.simulation_id),
            Some(step.step_id),
            Some(self.stage.as_str()),
            "failure",
            Some(message),
        );
        Ok(())
    }
}

async fn cleanup<E: Executor>(executor: &mut E) {
    if let Err(error) = executor.cleanup().await {
        log_error("stage", "cleanup", &error.to_string(), Some(executor.kind().as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutorError, ExecutorResult};
    use crate::executor::{ExecutorKind, ExecutorOutput};
    use crate::models::{CliRuntimeInfo, FileType, NewArtifact, NewSimulation};
    use crate::state_machine::StepStatus;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Finishes after a fixed number of status checks
    struct FakeExecutor {
        polls_until_done: usize,
        polls: Mutex<usize>,
        outcome: ExecutorResult<ExecutorOutput>,
        reject: bool,
        cleanups: Arc<Mutex<u32>>,
    }

    impl FakeExecutor {
        fn succeeding(polls_until_done: usize, output: ExecutorOutput) -> Self {
            Self {
                polls_until_done,
                polls: Mutex::new(0),
                outcome: Ok(output),
                reject: false,
                cleanups: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::Local
        }

        async fn execute(&mut self, _input: &crate::models::Artifact) -> ExecutorResult<()> {
            if self.reject {
                return Err(ExecutorError::submission("fake", "rejected"));
            }
            Ok(())
        }

        fn is_finished(&self) -> bool {
            let mut polls = self.polls.lock();
            *polls += 1;
            *polls > self.polls_until_done
        }

        fn status(&self) -> RuntimeInfo {
            RuntimeInfo::Cli(CliRuntimeInfo {
                cpu_percent: 50.0,
                memory_bytes: 1024,
                progress: 50.0,
                error: None,
            })
        }

        fn result(&self) -> ExecutorResult<ExecutorOutput> {
            self.outcome.clone()
        }

        async fn cleanup(&mut self) -> ExecutorResult<()> {
            *self.cleanups.lock() += 1;
            Ok(())
        }
    }

    fn fast_config() -> StageExecutorConfig {
        StageExecutorConfig {
            polling_period_ms: 5,
            ..StageExecutorConfig::cli_defaults()
        }
    }

    async fn seeded_store() -> (Arc<InMemoryStore>, i64, i64, i64) {
        let store = Arc::new(InMemoryStore::new());
        let (simulation, step) = store
            .create_simulation(NewSimulation::new("demo", PipelineStage::Cli))
            .await
            .unwrap();
        let conf = store
            .register_configuration(
                simulation.simulation_id,
                "/tmp/SIM_1",
                NewArtifact::from_file(
                    simulation.simulation_id,
                    step.step_id,
                    "/tmp/SIM_1/demo.json",
                    Some(FileType::Json),
                ),
            )
            .await
            .unwrap();
        (store, simulation.simulation_id, step.step_id, conf.artifact_id)
    }

    fn cli_output(simulation_id: i64, step_id: i64) -> ExecutorOutput {
        ExecutorOutput::Single(NewArtifact::from_file(
            simulation_id,
            step_id,
            "/tmp/SIM_1/cli_out.csv",
            Some(FileType::Csv),
        ))
    }

    #[tokio::test]
    async fn test_successful_stage_adopts_setup_step() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(2, cli_output(simulation_id, step_id));
        let cleanups = executor.cleanups.clone();

        let artifact_id = stage
            .run_with(
                executor,
                StageContext::new(simulation_id, conf_id, CancellationToken::new()),
            )
            .await
            .unwrap();

        let step = store.step(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Success);
        let artifact = store.artifact(artifact_id).await.unwrap();
        assert_eq!(artifact.step_id, step_id);
        assert_eq!(artifact.file_type, FileType::Csv);
        assert_eq!(
            store.runtime_info(step_id).await.unwrap(),
            Some(RuntimeInfo::Cli(CliRuntimeInfo {
                cpu_percent: 0.0,
                memory_bytes: 0,
                progress: 100.0,
                error: None,
            }))
        );
        assert_eq!(*cleanups.lock(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_step() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let mut executor = FakeExecutor::succeeding(0, cli_output(simulation_id, step_id));
        executor.reject = true;
        let cleanups = executor.cleanups.clone();

        let err = stage
            .run_with(
                executor,
                StageContext::new(simulation_id, conf_id, CancellationToken::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Executor(ExecutorError::Submission { .. })));
        let step = store.step(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failure);
        assert!(step.error_message.unwrap().contains("rejected"));
        assert_eq!(*cleanups.lock(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let mut executor = FakeExecutor::succeeding(1, cli_output(simulation_id, step_id));
        executor.outcome = Err(ExecutorError::Process("exit status 3".to_string()));

        let err = stage
            .run_with(
                executor,
                StageContext::new(simulation_id, conf_id, CancellationToken::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Executor(ExecutorError::Process(_))));
        let runtime = store.runtime_info(step_id).await.unwrap().unwrap();
        assert!(runtime.error().unwrap().contains("exit status 3"));
    }

    #[tokio::test]
    async fn test_empty_output_has_no_primary_artifact() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(0, ExecutorOutput::Many(Vec::new()));

        let err = stage
            .run_with(
                executor,
                StageContext::new(simulation_id, conf_id, CancellationToken::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoPrimaryArtifact { .. }));
        assert_eq!(store.step(step_id).await.unwrap().status, StepStatus::Failure);
    }

    #[tokio::test]
    async fn test_revocation_between_polls() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(usize::MAX, cli_output(simulation_id, step_id));
        let cleanups = executor.cleanups.clone();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = stage
            .run_with(executor, StageContext::new(simulation_id, conf_id, cancel))
            .await
            .unwrap_err();

        assert!(err.is_revocation());
        let step = store.step(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failure);
        assert_eq!(step.error_message.as_deref(), Some(REVOKED_MESSAGE));
        assert_eq!(*cleanups.lock(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_creates_no_step() {
        let (store, simulation_id, _, conf_id) = seeded_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stage = ExecutorStage::new(PipelineStage::Analyzer, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(0, ExecutorOutput::Many(Vec::new()));

        let err = stage
            .run_with(executor, StageContext::new(simulation_id, conf_id, cancel))
            .await
            .unwrap_err();

        assert!(err.is_revocation());
        let steps = store.steps_for_simulation(simulation_id).await.unwrap();
        assert!(steps.iter().all(|step| step.origin != PipelineStage::Analyzer));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_releases_setup_step() {
        let (store, simulation_id, step_id, conf_id) = seeded_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(0, cli_output(simulation_id, step_id));

        let err = stage
            .run_with(executor, StageContext::new(simulation_id, conf_id, cancel))
            .await
            .unwrap_err();

        assert!(err.is_revocation());
        let step = store.step(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failure);
        assert_eq!(step.error_message.as_deref(), Some(REVOKED_MESSAGE));
    }

    #[tokio::test]
    async fn test_missing_input_artifact_fails_setup_step() {
        let (store, simulation_id, step_id, _) = seeded_store().await;
        let stage = ExecutorStage::new(PipelineStage::Cli, fast_config(), store.clone());
        let executor = FakeExecutor::succeeding(0, cli_output(simulation_id, step_id));
        let cleanups = executor.cleanups.clone();

        let err = stage
            .run_with(
                executor,
                StageContext::new(simulation_id, 9_999, CancellationToken::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Store(_)));
        let step = store.step(step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Failure);
        assert!(step.error_message.is_some());
        assert_eq!(*cleanups.lock(), 0);
        assert!(store.current_simulation().await.unwrap().is_none());
    }
}

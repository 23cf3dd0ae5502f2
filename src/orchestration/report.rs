//! # REPORT stage
//!
//! Renders one plot per tracked parameter in parallel, then assembles the PDF report from
//! the plots. Rendering itself is delegated to a [`ReportRenderer`]; the default
//! [`CommandRenderer`] shells out to the reports tool:
//!
//! - `<command> plot <workdir> <parameter>` writes `plots/<parameter>.png`
//! - `<command> report <workdir>` writes `reports/simulation_report.pdf`
//!
//! Progress is `completed plots / tracked parameters`. A failed plot is retried up to
//! `plot_retries` more times before the stage fails.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ReportConfig;
use crate::constants::{tasks, PLOTS_DIR, REPORTS_DIR, REPORT_FILE, REVOKED_MESSAGE};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_step_operation;
use crate::models::{NewArtifact, ReportRuntimeInfo, RuntimeInfo, Step};
use crate::orchestration::worker_pool::TaskHandle;
use crate::state_machine::PipelineStage;
use crate::store::PipelineStore;

#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render_plot(&self, workdir: &Path, parameter: &str) -> PipelineResult<()>;

    async fn assemble_report(&self, workdir: &Path) -> PipelineResult<()>;
}

/// Renderer backed by an external command
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: String,
}

impl CommandRenderer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn invoke(&self, args: &[&str]) -> PipelineResult<()> {
        let output = Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|e| PipelineError::Render(format!("failed to run {}: {e}", self.command)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PipelineError::Render(format!(
                "{} {} exited with {}: {}",
                self.command,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ReportRenderer for CommandRenderer {
    async fn render_plot(&self, workdir: &Path, parameter: &str) -> PipelineResult<()> {
        let workdir = workdir.to_string_lossy();
        self.invoke(&["plot", &workdir, parameter]).await
    }

    async fn assemble_report(&self, workdir: &Path) -> PipelineResult<()> {
        let workdir = workdir.to_string_lossy();
        self.invoke(&["report", &workdir]).await
    }
}

pub struct ReportStage {
    store: Arc<dyn PipelineStore>,
    renderer: Arc<dyn ReportRenderer>,
    config: ReportConfig,
}

impl ReportStage {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        renderer: Arc<dyn ReportRenderer>,
        config: ReportConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            config,
        }
    }

    /// Run the stage for `simulation_id`; returns the id of the report artifact.
    #[instrument(skip(self, cancel, task_handle))]
    pub async fn run(
        &self,
        simulation_id: i64,
        cancel: CancellationToken,
        task_handle: Option<TaskHandle>,
    ) -> PipelineResult<i64> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Revoked {
                stage: PipelineStage::Report,
            });
        }

        let simulation = self.store.simulation(simulation_id).await?;
        let workdir = simulation.workdir.map(PathBuf::from).ok_or_else(|| {
            PipelineError::Workdir(format!("simulation {simulation_id} has no workdir"))
        })?;

        let total = self.config.tracked_parameters.len();
        let step = self
            .store
            .begin_step(
                simulation_id,
                PipelineStage::Report,
                RuntimeInfo::Report(ReportRuntimeInfo::with_jobs(0, total)),
            )
            .await?;
        log_step_operation(
            "begin",
            Some(simulation_id),
            Some(step.step_id),
            Some(PipelineStage::Report.as_str()),
            "ongoing",
            Some(&format!("{total} plot(s)")),
        );

        let artifacts = match self.produce(&workdir, &step, &cancel, task_handle).await {
            Ok(artifacts) => artifacts,
            Err(error) => {
                self.fail(&step, &error, total).await?;
                return Err(error);
            }
        };

        let artifacts = self
            .store
            .complete_step(
                step.step_id,
                artifacts,
                Some(RuntimeInfo::Report(ReportRuntimeInfo::with_jobs(total, total))),
            )
            .await?;

        let primary = artifacts
            .iter()
            .find(|artifact| artifact.path.ends_with(REPORT_FILE))
            .or_else(|| artifacts.first())
            .map(|artifact| artifact.artifact_id)
            .ok_or(PipelineError::NoPrimaryArtifact {
                stage: PipelineStage::Report,
            })?;

        log_step_operation(
            "complete",
            Some(simulation_id),
            Some(step.step_id),
            Some(PipelineStage::Report.as_str()),
            "success",
            Some(&format!("{} artifact(s)", artifacts.len())),
        );
        Ok(primary)
    }

    /// Everything between opening and closing the step; any error fails the step
    async fn produce(
        &self,
        workdir: &Path,
        step: &Step,
        cancel: &CancellationToken,
        task_handle: Option<TaskHandle>,
    ) -> PipelineResult<Vec<NewArtifact>> {
        if let Some(handle) = task_handle {
            self.store
                .set_task_handle(step.step_id, &handle.to_string())
                .await?;
        }

        self.render(workdir, step, cancel).await?;

        let artifacts = collect_outputs(workdir, step.simulation_id, step.step_id).await?;
        if artifacts.is_empty() {
            return Err(PipelineError::NoPrimaryArtifact {
                stage: PipelineStage::Report,
            });
        }
        Ok(artifacts)
    }

    async fn fail(&self, step: &Step, error: &PipelineError, total: usize) -> PipelineResult<()> {
        let message = if error.is_revocation() {
            REVOKED_MESSAGE.to_string()
        } else {
            error.to_string()
        };
        let mut runtime = self
            .store
            .runtime_info(step.step_id)
            .await?
            .unwrap_or_else(|| RuntimeInfo::Report(ReportRuntimeInfo::with_jobs(0, total)));
        runtime.set_error(message.clone());
        self.store
            .fail_step(step.step_id, &message, Some(runtime))
            .await?;
        log_step_operation(
            "fail",
            Some(step.simulation_id),
            Some(step.step_id),
            Some(PipelineStage::Report.as_str()),
            "failure",
            Some(&message),
        );
        Ok(())
    }

    async fn render(
        &self,
        workdir: &Path,
        step: &Step,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        tokio::fs::create_dir_all(workdir.join(PLOTS_DIR)).await?;
        tokio::fs::create_dir_all(workdir.join(REPORTS_DIR)).await?;

        let total = self.config.tracked_parameters.len();
        let mut plots = JoinSet::new();
        for parameter in self.config.tracked_parameters.iter().cloned() {
            let renderer = self.renderer.clone();
            let workdir = workdir.to_path_buf();
            let attempts = self.config.plot_retries + 1;
            plots.spawn(async move {
                render_with_retries(renderer, workdir, parameter, attempts).await
            });
        }

        let mut completed = 0;
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    plots.abort_all();
                    return Err(PipelineError::Revoked { stage: PipelineStage::Report });
                }
                joined = plots.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            let outcome = joined
                .map_err(|e| PipelineError::Render(format!("plot task failed: {e}")))
                .and_then(|outcome| outcome);
            if let Err(error) = outcome {
                plots.abort_all();
                return Err(error);
            }

            completed += 1;
            let snapshot = RuntimeInfo::Report(ReportRuntimeInfo::with_jobs(completed, total));
            if let Err(error) = self.store.update_runtime_info(step.step_id, &snapshot).await {
                warn!(step_id = step.step_id, error = %error, "Failed to persist report progress");
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Revoked {
                stage: PipelineStage::Report,
            });
        }
        self.renderer.assemble_report(workdir).await
    }
}

async fn render_with_retries(
    renderer: Arc<dyn ReportRenderer>,
    workdir: PathBuf,
    parameter: String,
    attempts: u32,
) -> PipelineResult<()> {
    let mut attempt = 1;
    loop {
        match renderer.render_plot(&workdir, &parameter).await {
            Ok(()) => {
                debug!(task = tasks::PLOT, parameter = %parameter, attempt, "Plot rendered");
                return Ok(());
            }
            Err(error) if attempt < attempts => {
                warn!(
                    task = tasks::PLOT,
                    parameter = %parameter,
                    attempt,
                    error = %error,
                    "Plot failed, retrying"
                );
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Files under `plots/` and `reports/`, in path order
async fn collect_outputs(
    workdir: &Path,
    simulation_id: i64,
    step_id: i64,
) -> PipelineResult<Vec<NewArtifact>> {
    let mut paths = Vec::new();
    for dir in [PLOTS_DIR, REPORTS_DIR] {
        let mut entries = tokio::fs::read_dir(workdir.join(dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
    }
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| NewArtifact::from_file(simulation_id, step_id, path, None))
        .collect())
}

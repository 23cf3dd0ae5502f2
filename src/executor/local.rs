//! Local subprocess executor.
//!
//! Runs the simulator as `<binary> <configuration path> <output path>` with stdout written
//! to the output file in the input's workdir. Each stderr line is a `<current>/<target>`
//! progress report; process CPU and resident memory are sampled from the OS every
//! `sample_every_lines` lines.
//!
//! A malformed progress line is recorded in the runtime snapshot and stops progress
//! tracking, but stderr keeps being drained so the simulator never blocks on a full pipe.
//! When the process exits the run finishes with `MonitoringParse`, so the step fails
//! instead of stalling. The subprocess is never killed by the executor.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, instrument, warn};

use super::progress::{parse_progress_line, ProgressTracker};
use super::{Executor, ExecutorKind, ExecutorOutput};
use crate::config::LocalExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::logging::log_executor_operation;
use crate::models::{Artifact, CliRuntimeInfo, FileType, NewArtifact, RuntimeInfo};
use crate::monitor::{progress_channel, ProgressHandle, ProgressReporter};

pub struct LocalExecutor {
    config: LocalExecutorConfig,
    progress: Option<ProgressHandle>,
}

impl LocalExecutor {
    pub fn new(config: LocalExecutorConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Path of the output file for a given input
    pub fn output_path(&self, input: &Artifact) -> ExecutorResult<PathBuf> {
        let workdir = input.workdir().ok_or_else(|| {
            ExecutorError::Process(format!("input {} has no parent directory", input.path))
        })?;
        Ok(workdir.join(&self.config.output_file))
    }
}

/// What the monitoring task needs to build the result artifact
struct OutputSpec {
    path: PathBuf,
    file_type: FileType,
    simulation_id: i64,
    step_id: i64,
}

#[async_trait]
impl Executor for LocalExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    #[instrument(
        skip(self, input),
        fields(binary = %self.config.binary_path.display(), input = %input.path)
    )]
    async fn execute(&mut self, input: &Artifact) -> ExecutorResult<()> {
        if self.progress.is_some() {
            return Err(ExecutorError::Process("executor already started".to_string()));
        }

        let path = self.output_path(input)?;
        if path == Path::new(&input.path) {
            return Err(ExecutorError::Process(format!(
                "output file {} would overwrite the input",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = OutputSpec {
            path,
            file_type: FileType::from_str(&self.config.output_file_type)
                .map_err(ExecutorError::Process)?,
            simulation_id: input.simulation_id,
            step_id: input.step_id,
        };

        let stdout = std::fs::File::create(&output.path)?;
        let mut child = Command::new(&self.config.binary_path)
            .arg(&input.path)
            .arg(&output.path)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                ExecutorError::Process(format!(
                    "failed to spawn {}: {e}",
                    self.config.binary_path.display()
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Process("stderr was not captured".to_string()))?;

        log_executor_operation(
            "execute",
            ExecutorKind::Local.as_str(),
            "spawned",
            Some(&format!("pid={:?}", child.id())),
        );

        let (reporter, handle) = progress_channel(RuntimeInfo::Cli(CliRuntimeInfo::default()));
        let sample_every = self.config.sample_every_lines.max(1);
        tokio::spawn(follow_process(child, stderr, reporter, output, sample_every));
        self.progress = Some(handle);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.progress
            .as_ref()
            .map(ProgressHandle::is_finished)
            .unwrap_or(false)
    }

    fn status(&self) -> RuntimeInfo {
        self.progress
            .as_ref()
            .map(ProgressHandle::snapshot)
            .unwrap_or_else(|| RuntimeInfo::Cli(CliRuntimeInfo::default()))
    }

    fn result(&self) -> ExecutorResult<ExecutorOutput> {
        self.progress
            .as_ref()
            .ok_or(ExecutorError::ResultNotReady)?
            .outcome()
    }

    async fn cleanup(&mut self) -> ExecutorResult<()> {
        // The simulator is left to run to completion
        Ok(())
    }
}

/// Read the sampled resource usage of `pid`, if the process is still alive
fn sample_resources(system: &mut System, pid: Pid) -> Option<(f32, u64)> {
    if !system.refresh_process(pid) {
        return None;
    }
    system
        .process(pid)
        .map(|process| (process.cpu_usage(), process.memory()))
}

async fn follow_process(
    mut child: Child,
    stderr: ChildStderr,
    reporter: ProgressReporter,
    output: OutputSpec,
    sample_every: u64,
) {
    let pid = child.id().map(Pid::from_u32);
    let parse_failure = follow_stderr(stderr, &reporter, pid, sample_every).await;

    let outcome = match child.wait().await {
        Err(error) => Err(ExecutorError::Process(error.to_string())),
        Ok(status) if !status.success() => Err(ExecutorError::Process(format!(
            "simulator exited with {status}"
        ))),
        Ok(_) => match parse_failure {
            Some(line) => Err(ExecutorError::MonitoringParse { line }),
            None => Ok(ExecutorOutput::Single(build_output(&output))),
        },
    };

    debug!(
        output = %output.path.display(),
        success = outcome.is_ok(),
        "Simulator process finished"
    );
    reporter.finish(outcome);
}

/// Track progress from stderr until EOF or a read error. Takes the reader by value so the
/// pipe is closed before the caller waits on the child. Returns the first malformed line.
async fn follow_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    reporter: &ProgressReporter,
    pid: Option<Pid>,
    sample_every: u64,
) -> Option<String> {
    let mut system = System::new();
    let mut tracker = ProgressTracker::default();
    let mut lines = BufReader::new(stderr).lines();
    let mut parse_failure: Option<String> = None;
    let mut progress_lines = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(error = %error, "Failed to read simulator stderr");
                break;
            }
        };

        if parse_failure.is_some() {
            continue;
        }

        match parse_progress_line(&line) {
            Ok((current, target)) => {
                let progress = tracker.advance(current, target);
                let sample = if progress_lines % sample_every == 0 {
                    pid.and_then(|pid| sample_resources(&mut system, pid))
                } else {
                    None
                };
                progress_lines += 1;

                reporter.update(|info| match info {
                    RuntimeInfo::Cli(cli) => {
                        cli.progress = progress;
                        if let Some((cpu_percent, memory_bytes)) = sample {
                            cli.cpu_percent = cpu_percent;
                            cli.memory_bytes = memory_bytes;
                        }
                    }
                    other => other.set_progress(progress),
                });
            }
            Err(_) => {
                warn!(line = %line, "Unexpected stderr output in simulator");
                reporter.update(|info| {
                    info.set_error(format!("Unexpected stderr output in simulator: {line}"))
                });
                parse_failure = Some(line);
            }
        }
    }
    parse_failure
}

fn build_output(output: &OutputSpec) -> NewArtifact {
    NewArtifact::from_file(
        output.simulation_id,
        output.step_id,
        Path::new(&output.path),
        Some(output.file_type),
    )
}

//! # Executors
//!
//! Polymorphic runners for a stage's unit of work. An executor is started once with the
//! stage's input artifact, polled without blocking until it reports completion, asked for
//! its result and finally cleaned up.
//!
//! - [`LocalExecutor`]: spawns the simulator binary and follows its stderr progress lines
//! - [`HttpExecutor`]: submits to a remote backend and polls its runtime endpoint
//! - [`SshExecutor`]: the HTTP executor reached through an SSH port forward
//!
//! Stages build executors through [`StageExecutor::from_config`], keyed by the
//! configured [`ExecutorKind`].

pub mod http;
pub mod local;
pub mod progress;
pub mod ssh;
pub mod tunnel;

use async_trait::async_trait;

use crate::config::StageExecutorConfig;
use crate::error::ExecutorResult;
use crate::models::{Artifact, NewArtifact, RuntimeInfo};

pub use crate::config::ExecutorKind;
pub use http::HttpExecutor;
pub use local::LocalExecutor;
pub use progress::{parse_progress_line, ProgressTracker};
pub use ssh::SshExecutor;
pub use tunnel::{SshTunnel, Tunnel};

/// What a finished executor produced
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorOutput {
    Single(NewArtifact),
    Many(Vec<NewArtifact>),
}

impl ExecutorOutput {
    pub fn into_artifacts(self) -> Vec<NewArtifact> {
        match self {
            Self::Single(artifact) => vec![artifact],
            Self::Many(artifacts) => artifacts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(artifacts) => artifacts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Start the work. Returns once the backend accepted it; monitoring continues in the
    /// background.
    async fn execute(&mut self, input: &Artifact) -> ExecutorResult<()>;

    /// Non-blocking completion check
    fn is_finished(&self) -> bool;

    /// Latest runtime snapshot; never blocks
    fn status(&self) -> RuntimeInfo;

    /// The produced artifacts, or `ResultNotReady` before completion. A failed run returns
    /// its error here.
    fn result(&self) -> ExecutorResult<ExecutorOutput>;

    /// Release backend resources. Safe to call any number of times.
    async fn cleanup(&mut self) -> ExecutorResult<()>;
}

/// Executor variants selectable from configuration
pub enum StageExecutor {
    Local(LocalExecutor),
    Http(HttpExecutor),
    Ssh(SshExecutor),
}

impl StageExecutor {
    pub fn from_config(config: &StageExecutorConfig) -> ExecutorResult<Self> {
        Ok(match config.executor {
            ExecutorKind::Local => Self::Local(LocalExecutor::new(config.local.clone())),
            ExecutorKind::Http => Self::Http(HttpExecutor::new(
                config.http.clone(),
                config.polling_period(),
            )?),
            ExecutorKind::Ssh => Self::Ssh(SshExecutor::new(
                SshTunnel::new(config.ssh.clone()),
                HttpExecutor::new(config.http.clone(), config.polling_period())?,
            )),
        })
    }

    fn inner(&self) -> &dyn Executor {
        match self {
            Self::Local(executor) => executor,
            Self::Http(executor) => executor,
            Self::Ssh(executor) => executor,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Executor {
        match self {
            Self::Local(executor) => executor,
            Self::Http(executor) => executor,
            Self::Ssh(executor) => executor,
        }
    }
}

#[async_trait]
impl Executor for StageExecutor {
    fn kind(&self) -> ExecutorKind {
        self.inner().kind()
    }

    async fn execute(&mut self, input: &Artifact) -> ExecutorResult<()> {
        self.inner_mut().execute(input).await
    }

    fn is_finished(&self) -> bool {
        self.inner().is_finished()
    }

    fn status(&self) -> RuntimeInfo {
        self.inner().status()
    }

    fn result(&self) -> ExecutorResult<ExecutorOutput> {
        self.inner().result()
    }

    async fn cleanup(&mut self) -> ExecutorResult<()> {
        self.inner_mut().cleanup().await
    }
}

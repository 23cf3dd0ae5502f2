//! # Progress Monitor
//!
//! Background sampling bound to one in-flight unit of work.
//!
//! The monitoring task owns the [`ProgressReporter`] and is the only writer of the runtime
//! snapshot; the stage holds a [`ProgressHandle`] and only reads. Snapshots travel through
//! a `tokio::sync::watch` channel. The final outcome is stored in a write-once cell and
//! "finished" means "outcome present", so a reader that sees the executor finished always
//! sees its result too.
//!
//! [`ProgressMonitor`] drives remote backends: it polls a [`StatusSource`] at a fixed
//! period until the source reports completion, then fetches the result exactly once.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::ExecutorOutput;
use crate::models::RuntimeInfo;

type OutcomeCell = Arc<OnceLock<ExecutorResult<ExecutorOutput>>>;

/// Create a connected reporter/handle pair seeded with `initial`
pub fn progress_channel(initial: RuntimeInfo) -> (ProgressReporter, ProgressHandle) {
    let (sender, receiver) = watch::channel(initial);
    let outcome: OutcomeCell = Arc::new(OnceLock::new());
    (
        ProgressReporter {
            runtime: sender,
            outcome: outcome.clone(),
        },
        ProgressHandle {
            runtime: receiver,
            outcome,
        },
    )
}

/// Writing side, owned by the monitoring task
#[derive(Debug)]
pub struct ProgressReporter {
    runtime: watch::Sender<RuntimeInfo>,
    outcome: OutcomeCell,
}

impl ProgressReporter {
    /// Modify the current snapshot in place
    pub fn update(&self, modify: impl FnOnce(&mut RuntimeInfo)) {
        self.runtime.send_modify(modify);
    }

    pub fn replace(&self, runtime: RuntimeInfo) {
        self.runtime.send_replace(runtime);
    }

    /// Publish the final outcome. Later calls are ignored.
    pub fn finish(&self, outcome: ExecutorResult<ExecutorOutput>) -> bool {
        if let Err(error) = &outcome {
            let message = error.to_string();
            self.runtime.send_modify(|info| {
                if info.error().is_none() {
                    info.set_error(message);
                }
            });
        }
        self.outcome.set(outcome).is_ok()
    }
}

/// Reading side, held by the executor on behalf of the stage
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    runtime: watch::Receiver<RuntimeInfo>,
    outcome: OutcomeCell,
}

impl ProgressHandle {
    /// Latest snapshot; never blocks on the writer
    pub fn snapshot(&self) -> RuntimeInfo {
        self.runtime.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn outcome(&self) -> ExecutorResult<ExecutorOutput> {
        self.outcome
            .get()
            .cloned()
            .unwrap_or(Err(ExecutorError::ResultNotReady))
    }
}

/// One observation of a remote unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub runtime: RuntimeInfo,
    pub finished: bool,
}

/// Something the monitor can poll for progress and, once done, ask for the result
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn poll(&self) -> ExecutorResult<StatusUpdate>;

    async fn fetch_result(&self) -> ExecutorResult<ExecutorOutput>;
}

/// Fixed-period polling loop over a [`StatusSource`]
pub struct ProgressMonitor<S: StatusSource> {
    source: S,
    period: Duration,
    max_poll_failures: u32,
}

impl<S: StatusSource> ProgressMonitor<S> {
    pub fn new(source: S, period: Duration, max_poll_failures: u32) -> Self {
        Self {
            source,
            period,
            max_poll_failures,
        }
    }

    /// Run the loop on the runtime. Cancelling `cancel` stops polling without publishing
    /// an outcome.
    pub fn spawn(self, reporter: ProgressReporter, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(reporter, cancel).await })
    }

    pub async fn run(self, reporter: ProgressReporter, cancel: CancellationToken) {
        let mut consecutive_failures = 0u32;

        loop {
            match self.source.poll().await {
                Ok(update) => {
                    consecutive_failures = 0;
                    reporter.replace(update.runtime);
                    if update.finished {
                        debug!("Status source reported completion");
                        break;
                    }
                }
                Err(error) => {
                    consecutive_failures += 1;
                    warn!(
                        error = %error,
                        consecutive_failures,
                        "Runtime poll failed"
                    );
                    if consecutive_failures > self.max_poll_failures {
                        reporter.finish(Err(error));
                        return;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Progress monitor cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        // Result strictly before the finished flag: finishing is publishing the result
        let result = self.source.fetch_result().await;
        reporter.finish(result);
    }
}

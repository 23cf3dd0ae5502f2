//! Cooperative revocation of a simulation's stage chain.
//!
//! [`StageChain`] holds the stages that have not been dispatched yet. A stage that observes
//! its cancellation token returns [`PipelineError::Revoked`]; the [`RevocationGuard`]
//! around it turns that into the caller's fallback value and drops every pending stage.
//! Work already handed to an external process is not stopped.

use std::collections::VecDeque;
use std::future::Future;
use tracing::info;

use crate::error::PipelineResult;
use crate::state_machine::PipelineStage;

/// Not-yet-dispatched stages of one simulation, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageChain {
    pending: VecDeque<PipelineStage>,
}

impl StageChain {
    /// Every stage after `completed`, up to and including FINISHED
    pub fn after(completed: PipelineStage) -> Self {
        let mut pending = VecDeque::new();
        let mut stage = completed.next();
        while let Some(next) = stage {
            pending.push_back(next);
            stage = next.next();
        }
        Self { pending }
    }

    /// Take the next stage to dispatch
    pub fn dispatch_next(&mut self) -> Option<PipelineStage> {
        self.pending.pop_front()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PipelineStage> {
        self.pending.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending stage, returning what was dropped
    pub fn clear(&mut self) -> Vec<PipelineStage> {
        self.pending.drain(..).collect()
    }
}

/// Converts a revoked stage into a fallback value and truncates the chain
#[derive(Debug, Clone)]
pub struct RevocationGuard<T> {
    fallback: T,
}

impl<T: Clone> RevocationGuard<T> {
    pub fn new(fallback: T) -> Self {
        Self { fallback }
    }

    pub async fn run<F>(&self, chain: &mut StageChain, stage: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        match stage.await {
            Err(error) if error.is_revocation() => {
                let dropped = chain.clear();
                info!(
                    error = %error,
                    dropped = ?dropped,
                    "🛑 Stage revoked, downstream stages will not be dispatched"
                );
                Ok(self.fallback.clone())
            }
            other => other,
        }
    }
}

//! In-process task queue for stage functions.
//!
//! Every stage of a simulation is submitted as a named task and receives an opaque
//! [`TaskHandle`]. The handle can be looked up (`PENDING`, `PROGRESS`, `SUCCESS`,
//! `FAILURE` plus free-form meta) or revoked, which cancels the token the task was given.
//! Concurrency across all simulations is bounded by a semaphore. Finished tasks stay
//! visible to lookups for the retention window and are evicted on the next submission.
//!
//! # Examples
//!
//! ```rust
//! use simbad_pipeline::orchestration::worker_pool::{TaskQueue, TaskState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = TaskQueue::new(2);
//!     let (handle, join) = queue.submit("double", |_ctx| async { Ok(21 * 2) });
//!     assert_eq!(join.await.unwrap().unwrap(), 42);
//!     assert_eq!(queue.lookup(&handle).unwrap().state, TaskState::Success);
//! }
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// Opaque id of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskHandle {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PipelineError::Queue(format!("invalid task handle {s}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
}

/// Result of a lookup by handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub state: TaskState,
    pub meta: serde_json::Value,
    pub revoked: bool,
}

#[derive(Debug)]
struct TaskEntry {
    name: String,
    state: TaskState,
    meta: serde_json::Value,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

impl TaskEntry {
    fn expired(&self, retention: Duration) -> bool {
        self.finished_at
            .is_some_and(|finished_at| finished_at.elapsed() >= retention)
    }
}

/// Handed to every task: its handle, its cancellation token and a way to publish meta
#[derive(Clone)]
pub struct TaskContext {
    handle: TaskHandle,
    cancel: CancellationToken,
    tasks: Arc<DashMap<TaskHandle, TaskEntry>>,
}

impl TaskContext {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_revoked(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Replace the meta reported by lookups while the task is in PROGRESS
    pub fn set_meta(&self, meta: serde_json::Value) {
        if let Some(mut entry) = self.tasks.get_mut(&self.handle) {
            entry.meta = meta;
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    tasks: Arc<DashMap<TaskHandle, TaskEntry>>,
    permits: Arc<Semaphore>,
    retention: Duration,
}

impl TaskQueue {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            retention: Duration::from_secs(3_600),
        }
    }

    /// How long SUCCESS and FAILURE entries remain visible to lookups
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Submit a task with its own cancellation token
    pub fn submit<F, Fut, T>(
        &self,
        name: &str,
        job: F,
    ) -> (TaskHandle, JoinHandle<PipelineResult<T>>)
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_parent(name, &CancellationToken::new(), job)
    }

    /// Submit a task whose token is a child of `parent`, so cancelling the parent revokes
    /// every task submitted under it
    pub fn submit_with_parent<F, Fut, T>(
        &self,
        name: &str,
        parent: &CancellationToken,
        job: F,
    ) -> (TaskHandle, JoinHandle<PipelineResult<T>>)
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.evict_finished();

        let handle = TaskHandle::new();
        let cancel = parent.child_token();
        self.tasks.insert(
            handle,
            TaskEntry {
                name: name.to_string(),
                state: TaskState::Pending,
                meta: serde_json::Value::Null,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );

        let context = TaskContext {
            handle,
            cancel,
            tasks: self.tasks.clone(),
        };
        let tasks = self.tasks.clone();
        let permits = self.permits.clone();
        let task_name = name.to_string();

        let join = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Queue(format!("worker pool closed: {e}")))?;

            if let Some(mut entry) = tasks.get_mut(&handle) {
                entry.state = TaskState::Progress;
            }
            debug!(task = %task_name, handle = %handle, "Task started");

            let result = job(context).await;

            if let Some(mut entry) = tasks.get_mut(&handle) {
                entry.finished_at = Some(Instant::now());
                match &result {
                    Ok(_) => entry.state = TaskState::Success,
                    Err(error) => {
                        entry.state = TaskState::Failure;
                        entry.meta = serde_json::json!({ "error": error.to_string() });
                    }
                }
            }
            debug!(
                task = %task_name,
                handle = %handle,
                success = result.is_ok(),
                "Task finished"
            );
            result
        });

        (handle, join)
    }

    pub fn lookup(&self, handle: &TaskHandle) -> Option<TaskInfo> {
        self.tasks.get(handle).map(|entry| TaskInfo {
            name: entry.name.clone(),
            state: entry.state,
            meta: entry.meta.clone(),
            revoked: entry.cancel.is_cancelled(),
        })
    }

    /// Request cooperative cancellation of a task. Returns `false` for unknown handles.
    pub fn revoke(&self, handle: &TaskHandle) -> bool {
        match self.tasks.get(handle) {
            Some(entry) => {
                info!(task = %entry.name, handle = %handle, "Revoking task");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop finished entries older than the retention window. Returns how many were removed.
    pub fn evict_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| !entry.expired(self.retention));
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            debug!(evicted, "Evicted finished tasks");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lookup_tracks_lifecycle() {
        let queue = TaskQueue::new(1);
        let (handle, join) = queue.submit("progress", |ctx| async move {
            ctx.set_meta(serde_json::json!({"progress": 50}));
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let info = queue.lookup(&handle).unwrap();
        assert_eq!(info.state, TaskState::Progress);
        assert_eq!(info.meta["progress"], 50);

        join.await.unwrap().unwrap();
        assert_eq!(queue.lookup(&handle).unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let queue = TaskQueue::new(1);
        let (handle, join) = queue.submit("fails", |_ctx| async {
            Err::<(), _>(PipelineError::Render("plot crashed".to_string()))
        });
        assert!(join.await.unwrap().is_err());

        let info = queue.lookup(&handle).unwrap();
        assert_eq!(info.state, TaskState::Failure);
        assert!(info.meta["error"].as_str().unwrap().contains("plot crashed"));
    }

    #[tokio::test]
    async fn test_revoke_cancels_task_token() {
        let queue = TaskQueue::new(1);
        let (handle, join) = queue.submit("waits", |ctx| async move {
            ctx.cancellation_token().cancelled().await;
            Ok(ctx.is_revoked())
        });

        assert!(queue.revoke(&handle));
        assert!(join.await.unwrap().unwrap());
        assert!(queue.lookup(&handle).unwrap().revoked);
        assert!(!queue.revoke(&TaskHandle::new()));
    }

    #[tokio::test]
    async fn test_parent_token_revokes_children() {
        let queue = TaskQueue::new(2);
        let parent = CancellationToken::new();
        let (first, _) = queue.submit_with_parent("a", &parent, |ctx| async move {
            ctx.cancellation_token().cancelled().await;
            Ok(())
        });
        parent.cancel();
        assert!(queue.lookup(&first).unwrap().revoked);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = TaskQueue::new(1);
        let (_, first) = queue.submit("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (second, join) = queue.submit("queued", |_ctx| async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.lookup(&second).unwrap().state, TaskState::Pending);

        first.await.unwrap().unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(queue.lookup(&second).unwrap().state, TaskState::Success);
    }

    #[tokio::test]
    async fn test_finished_tasks_are_evicted_after_retention() {
        let queue = TaskQueue::new(2).with_retention(Duration::ZERO);
        let (done, join) = queue.submit("done", |_ctx| async { Ok(()) });
        join.await.unwrap().unwrap();
        assert_eq!(queue.lookup(&done).unwrap().state, TaskState::Success);

        let (running, _join) = queue.submit("running", |ctx| async move {
            ctx.cancellation_token().cancelled().await;
            Ok(())
        });
        assert!(queue.lookup(&done).is_none());
        assert_eq!(queue.evict_finished(), 0);
        assert!(queue.lookup(&running).is_some());
        queue.revoke(&running);
    }

    #[tokio::test]
    async fn test_finished_tasks_kept_within_retention() {
        let queue = TaskQueue::new(1);
        let (handle, join) = queue.submit("done", |_ctx| async { Ok(()) });
        join.await.unwrap().unwrap();

        assert_eq!(queue.evict_finished(), 0);
        assert_eq!(queue.lookup(&handle).unwrap().state, TaskState::Success);
    }

    #[test]
    fn test_handle_parsing() {
        let handle = TaskHandle::new();
        assert_eq!(handle.to_string().parse::<TaskHandle>().unwrap(), handle);
        assert!("not-a-uuid".parse::<TaskHandle>().is_err());
    }
}

//! HTTP executor for remote backends.
//!
//! Wire contract:
//! - `POST {start}` with `{"path": "<input path>"}`; `202 Accepted` means the work started
//! - `GET {status}` → `{"status": "BUSY" | "IDLE"}`
//! - `GET {runtime}` → `{"progress": <number>, "finished": <bool>}`
//! - `GET {result}` → `{"artifacts": [{"path": ..., "name"?, "file_type"?, "size_bytes"?}]}`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{Executor, ExecutorKind, ExecutorOutput};
use crate::config::HttpExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::logging::log_executor_operation;
use crate::models::{AnalyzerRuntimeInfo, Artifact, FileType, NewArtifact, RuntimeInfo};
use crate::monitor::{progress_channel, ProgressHandle, ProgressMonitor, StatusSource, StatusUpdate};

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    Busy,
    Idle,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: BackendStatus,
}

#[derive(Debug, Deserialize)]
struct RemoteArtifact {
    path: String,
    name: Option<String>,
    file_type: Option<String>,
    size_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    artifacts: Vec<RemoteArtifact>,
}

pub struct HttpExecutor {
    config: HttpExecutorConfig,
    client: reqwest::Client,
    polling_period: Duration,
    progress: Option<ProgressHandle>,
    cancel: CancellationToken,
}

impl HttpExecutor {
    pub fn new(config: HttpExecutorConfig, polling_period: Duration) -> ExecutorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            config,
            client,
            polling_period,
            progress: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Ask the status endpoint whether the backend is busy
    pub async fn backend_status(&self) -> ExecutorResult<BackendStatus> {
        let response: StatusResponse = self
            .client
            .get(&self.config.status_endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.status)
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Http
    }

    #[instrument(
        skip(self, input),
        fields(endpoint = %self.config.start_endpoint, input = %input.path)
    )]
    async fn execute(&mut self, input: &Artifact) -> ExecutorResult<()> {
        if self.progress.is_some() {
            return Err(ExecutorError::Backend("executor already started".to_string()));
        }

        if self.config.check_busy_before_submit
            && self.backend_status().await? == BackendStatus::Busy
        {
            return Err(ExecutorError::submission(
                &self.config.start_endpoint,
                "backend is BUSY",
            ));
        }

        let response = self
            .client
            .post(&self.config.start_endpoint)
            .json(&StartRequest { path: &input.path })
            .send()
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(ExecutorError::submission(
                &self.config.start_endpoint,
                format!("status {}", response.status()),
            ));
        }

        log_executor_operation(
            "execute",
            ExecutorKind::Http.as_str(),
            "accepted",
            Some(&self.config.start_endpoint),
        );

        let source = HttpStatusSource {
            client: self.client.clone(),
            runtime_endpoint: self.config.runtime_endpoint.clone(),
            result_endpoint: self.config.result_endpoint.clone(),
            simulation_id: input.simulation_id,
            step_id: input.step_id,
        };
        let (reporter, handle) =
            progress_channel(RuntimeInfo::Analyzer(AnalyzerRuntimeInfo::default()));
        ProgressMonitor::new(source, self.polling_period, self.config.max_poll_failures)
            .spawn(reporter, self.cancel.clone());
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
            .unwrap_or_else(|| RuntimeInfo::Analyzer(AnalyzerRuntimeInfo::default()))
    }

    fn result(&self) -> ExecutorResult<ExecutorOutput> {
        self.progress
            .as_ref()
            .ok_or(ExecutorError::ResultNotReady)?
            .outcome()
    }

    async fn cleanup(&mut self) -> ExecutorResult<()> {
        if !self.cancel.is_cancelled() {
            debug!("Stopping runtime polling");
            self.cancel.cancel();
        }
        Ok(())
    }
}

struct HttpStatusSource {
    client: reqwest::Client,
    runtime_endpoint: String,
    result_endpoint: String,
    simulation_id: i64,
    step_id: i64,
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn poll(&self) -> ExecutorResult<StatusUpdate> {
        let info: AnalyzerRuntimeInfo = self
            .client
            .get(&self.runtime_endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let finished = info.is_finished;
        Ok(StatusUpdate {
            runtime: RuntimeInfo::Analyzer(info),
            finished,
        })
    }

    async fn fetch_result(&self) -> ExecutorResult<ExecutorOutput> {
        let response: ResultResponse = self
            .client
            .get(&self.result_endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let artifacts = response
            .artifacts
            .into_iter()
            .map(|remote| {
                let file_type = remote
                    .file_type
                    .as_deref()
                    .and_then(|file_type| file_type.parse::<FileType>().ok());
                let mut artifact = NewArtifact::from_file(
                    self.simulation_id,
                    self.step_id,
                    &remote.path,
                    file_type,
                );
                if let Some(name) = remote.name {
                    artifact = artifact.with_name(name);
                }
                if let Some(size_bytes) = remote.size_bytes {
                    artifact.size_bytes = size_bytes;
                }
                artifact
            })
            .collect();

        Ok(ExecutorOutput::Many(artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, routing::post, Json, Router};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config_for(base: &str) -> HttpExecutorConfig {
        HttpExecutorConfig {
            start_endpoint: format!("{base}/start"),
            status_endpoint: format!("{base}/status"),
            runtime_endpoint: format!("{base}/runtime"),
            result_endpoint: format!("{base}/result"),
            request_timeout_ms: 2_000,
            check_busy_before_submit: false,
            max_poll_failures: 1,
        }
    }

    fn input() -> Artifact {
        Artifact {
            artifact_id: 4,
            simulation_id: 1,
            step_id: 2,
            created_at: Utc::now(),
            size_bytes: 10,
            path: "/data/SIM_1/cli_out.csv".to_string(),
            name: "cli_out".to_string(),
            file_type: FileType::Csv,
        }
    }

    fn analyzer_backend() -> Router {
        let polls = Arc::new(AtomicU32::new(0));
        Router::new()
            .route(
                "/start",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["path"], "/data/SIM_1/cli_out.csv");
                    AxumStatus::ACCEPTED
                }),
            )
            .route(
                "/runtime",
                get(move || {
                    let polls = polls.clone();
                    async move {
                        let n = polls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Json(json!({"progress": 50, "finished": false}))
                        } else {
                            Json(json!({"progress": 100, "finished": true}))
                        }
                    }
                }),
            )
            .route(
                "/result",
                get(|| async {
                    Json(json!({"artifacts": [
                        {
                            "path": "/data/SIM_1/output_data/clone_stats_scalars.parquet",
                            "size_bytes": 2048
                        },
                        {
                            "path": "/data/SIM_1/output_data/time_points.parquet",
                            "name": "time_points"
                        }
                    ]}))
                }),
            )
    }

    #[tokio::test]
    async fn test_accepted_run_reports_artifacts() {
        let base = serve(analyzer_backend()).await;
        let mut executor = HttpExecutor::new(config_for(&base), Duration::from_millis(10)).unwrap();

        executor.execute(&input()).await.unwrap();
        for _ in 0..200 {
            if executor.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(executor.is_finished());
        assert_eq!(executor.status().progress(), 100.0);
        let artifacts = executor.result().unwrap().into_artifacts();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].file_type, FileType::Parquet);
        assert_eq!(artifacts[0].size_bytes, 2048);
        assert_eq!(artifacts[0].step_id, 2);
        assert_eq!(artifacts[1].name, "time_points");

        executor.cleanup().await.unwrap();
        executor.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_start_is_submission_error() {
        let app = Router::new().route(
            "/start",
            post(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        );
        let base = serve(app).await;
        let mut executor = HttpExecutor::new(config_for(&base), Duration::from_millis(10)).unwrap();

        let err = executor.execute(&input()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Submission { .. }));
        assert!(err.to_string().contains("500"));
        assert!(!executor.is_finished());
    }

    #[tokio::test]
    async fn test_busy_backend_is_not_submitted_to() {
        let started = Arc::new(AtomicU32::new(0));
        let counter = started.clone();
        let app = Router::new()
            .route("/status", get(|| async { Json(json!({"status": "BUSY"})) }))
            .route(
                "/start",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        AxumStatus::ACCEPTED
                    }
                }),
            );
        let base = serve(app).await;
        let mut config = config_for(&base);
        config.check_busy_before_submit = true;
        let mut executor = HttpExecutor::new(config, Duration::from_millis(10)).unwrap();

        let err = executor.execute(&input()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Submission { .. }));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_the_run() {
        let app = Router::new().route("/start", post(|| async { AxumStatus::ACCEPTED }));
        let base = serve(app).await;
        let mut executor = HttpExecutor::new(config_for(&base), Duration::from_millis(5)).unwrap();

        executor.execute(&input()).await.unwrap();
        for _ in 0..200 {
            if executor.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(executor.result(), Err(ExecutorError::Backend(_))));
    }
}

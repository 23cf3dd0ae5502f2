//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{http::StatusCode, routing::get, routing::post, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use simbad_pipeline::config::{
    ExecutorKind, HttpExecutorConfig, LocalExecutorConfig, PipelineConfig, ReportConfig,
    StageExecutorConfig,
};
use simbad_pipeline::constants::{PLOTS_DIR, REPORTS_DIR, REPORT_FILE};
use simbad_pipeline::error::PipelineResult;
use simbad_pipeline::orchestration::{ReportRenderer, SimulationRequest};

pub const POLLING_PERIOD_MS: u64 = 10;

/// Write an executable `sh` script standing in for the simulator binary
#[cfg(unix)]
pub fn fake_binary(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("simbad-cli");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn http_config(base: &str) -> HttpExecutorConfig {
    HttpExecutorConfig {
        start_endpoint: format!("{base}/start"),
        status_endpoint: format!("{base}/status"),
        runtime_endpoint: format!("{base}/runtime"),
        result_endpoint: format!("{base}/result"),
        request_timeout_ms: 2_000,
        check_busy_before_submit: false,
        max_poll_failures: 3,
    }
}

/// Analyzer backend that finishes on the second runtime poll and records the submitted path
pub fn analyzer_backend(submitted: Arc<Mutex<Option<String>>>) -> Router {
    let polls = Arc::new(AtomicU32::new(0));
    Router::new()
        .route(
            "/start",
            post(move |Json(body): Json<Value>| {
                let submitted = submitted.clone();
                async move {
                    *submitted.lock() = body["path"].as_str().map(str::to_string);
                    StatusCode::ACCEPTED
                }
            }),
        )
        .route("/status", get(|| async { Json(json!({"status": "IDLE"})) }))
        .route(
            "/runtime",
            get(move || {
                let polls = polls.clone();
                async move {
                    if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Json(json!({"progress": 40, "finished": false}))
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
                        "path": "output_data/clone_stats_scalars.parquet",
                        "file_type": "PARQUET",
                        "size_bytes": 4096
                    },
                    {"path": "output_data/time_points.parquet", "size_bytes": 1024}
                ]}))
            }),
        )
}

pub fn local_stage(binary: PathBuf) -> StageExecutorConfig {
    StageExecutorConfig {
        executor: ExecutorKind::Local,
        polling_period_ms: POLLING_PERIOD_MS,
        local: LocalExecutorConfig {
            binary_path: binary,
            sample_every_lines: 1,
            ..LocalExecutorConfig::default()
        },
        ..StageExecutorConfig::cli_defaults()
    }
}

pub fn http_stage(base: &str) -> StageExecutorConfig {
    StageExecutorConfig {
        executor: ExecutorKind::Http,
        polling_period_ms: POLLING_PERIOD_MS,
        http: http_config(base),
        ..StageExecutorConfig::analyzer_defaults()
    }
}

pub fn pipeline_config(
    data_path: &Path,
    cli: StageExecutorConfig,
    analyzer: StageExecutorConfig,
) -> PipelineConfig {
    PipelineConfig {
        data_path: data_path.to_path_buf(),
        cli,
        analyzer,
        report: ReportConfig {
            tracked_parameters: vec!["entropy".to_string(), "cloneCount".to_string()],
            plot_retries: 1,
            ..ReportConfig::default()
        },
        ..PipelineConfig::default()
    }
}

pub fn demo_request() -> SimulationRequest {
    SimulationRequest {
        configuration_name: "demo".to_string(),
        configuration: json!({"parameters": {"mutations": 3, "steps": 10}}),
        name: None,
    }
}

/// Renderer writing placeholder PNG and PDF files
#[derive(Default)]
pub struct FakeRenderer {
    pub plots: Mutex<Vec<String>>,
}

#[async_trait]
impl ReportRenderer for FakeRenderer {
    async fn render_plot(&self, workdir: &Path, parameter: &str) -> PipelineResult<()> {
        tokio::fs::write(workdir.join(PLOTS_DIR).join(format!("{parameter}.png")), b"png").await?;
        self.plots.lock().push(parameter.to_string());
        Ok(())
    }

    async fn assemble_report(&self, workdir: &Path) -> PipelineResult<()> {
        tokio::fs::write(workdir.join(REPORTS_DIR).join(REPORT_FILE), b"%PDF-1.4").await?;
        Ok(())
    }
}

/// Poll `check` until it holds or the deadline passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

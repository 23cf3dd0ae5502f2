//! HTTP executor reached through an SSH tunnel.
//!
//! The tunnel is opened right before the start request and closed on cleanup, or
//! immediately when the start request fails. It never outlives the step.

use async_trait::async_trait;
use tracing::warn;

use super::http::HttpExecutor;
use super::tunnel::{SshTunnel, Tunnel};
use super::{Executor, ExecutorKind, ExecutorOutput};
use crate::error::ExecutorResult;
use crate::logging::log_executor_operation;
use crate::models::{Artifact, RuntimeInfo};

pub struct SshExecutor<T: Tunnel = SshTunnel> {
    tunnel: T,
    http: HttpExecutor,
}

impl<T: Tunnel> SshExecutor<T> {
    pub fn new(tunnel: T, http: HttpExecutor) -> Self {
        Self { tunnel, http }
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }
}

#[async_trait]
impl<T: Tunnel> Executor for SshExecutor<T> {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Ssh
    }

    async fn execute(&mut self, input: &Artifact) -> ExecutorResult<()> {
        self.tunnel.open().await?;
        log_executor_operation("tunnel_open", ExecutorKind::Ssh.as_str(), "open", None);

        if let Err(error) = self.http.execute(input).await {
            if let Err(close_error) = self.tunnel.close().await {
                warn!(error = %close_error, "Failed to close tunnel after rejected submission");
            }
            return Err(error);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.http.is_finished()
    }

    fn status(&self) -> RuntimeInfo {
        self.http.status()
    }

    fn result(&self) -> ExecutorResult<ExecutorOutput> {
        self.http.result()
    }

    async fn cleanup(&mut self) -> ExecutorResult<()> {
        self.http.cleanup().await?;
        if self.tunnel.is_open() {
            self.tunnel.close().await?;
            log_executor_operation("tunnel_close", ExecutorKind::Ssh.as_str(), "closed", None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpExecutorConfig, SshTunnelConfig};
    use crate::error::ExecutorError;
    use crate::models::FileType;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        opens: u32,
        closes: u32,
    }

    struct RecordingTunnel {
        open: bool,
        counters: Arc<Mutex<Counters>>,
    }

    #[async_trait]
    impl Tunnel for RecordingTunnel {
        async fn open(&mut self) -> ExecutorResult<()> {
            self.open = true;
            self.counters.lock().opens += 1;
            Ok(())
        }

        async fn close(&mut self) -> ExecutorResult<()> {
            if self.open {
                self.open = false;
                self.counters.lock().closes += 1;
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn unreachable_http() -> HttpExecutor {
        HttpExecutor::new(
            HttpExecutorConfig {
                start_endpoint: "http://127.0.0.1:1/start".to_string(),
                request_timeout_ms: 500,
                ..HttpExecutorConfig::default()
            },
            Duration::from_millis(10),
        )
        .unwrap()
    }

    fn input() -> Artifact {
        Artifact {
            artifact_id: 1,
            simulation_id: 1,
            step_id: 1,
            created_at: Utc::now(),
            size_bytes: 0,
            path: "/data/SIM_1/cli_out.csv".to_string(),
            name: "cli_out".to_string(),
            file_type: FileType::Csv,
        }
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_idempotent() {
        let tunnel = SshTunnel::new(SshTunnelConfig::default());
        let mut executor = SshExecutor::new(tunnel, unreachable_http());
        executor.cleanup().await.unwrap();
        executor.cleanup().await.unwrap();
        assert!(!executor.tunnel().is_open());
    }

    #[tokio::test]
    async fn test_failed_submission_closes_tunnel() {
        let counters = Arc::new(Mutex::new(Counters::default()));
        let tunnel = RecordingTunnel {
            open: false,
            counters: counters.clone(),
        };
        let mut executor = SshExecutor::new(tunnel, unreachable_http());

        let err = executor.execute(&input()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Backend(_)));
        assert!(!executor.tunnel().is_open());

        executor.cleanup().await.unwrap();
        executor.cleanup().await.unwrap();
        let counters = counters.lock();
        assert_eq!(counters.opens, 1);
        assert_eq!(counters.closes, 1);
    }
}

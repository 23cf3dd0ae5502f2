//! # Pipeline Configuration
//!
//! Layered configuration for the simulation pipeline: an optional TOML file followed by
//! `SIMBAD__*` environment overrides. Each executable stage picks its executor kind and
//! polling period independently, so the CLI stage can run locally while the analyzer runs
//! behind an SSH tunnel.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use simbad_pipeline::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let polling = manager.config().analyzer.polling_period();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Where a stage's unit of work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorKind {
    #[serde(rename = "LOCAL", alias = "local", alias = "Local")]
    Local,
    #[serde(rename = "HTTP", alias = "http", alias = "Http")]
    Http,
    #[serde(rename = "SSH", alias = "ssh", alias = "Ssh")]
    Ssh,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Http => "HTTP",
            Self::Ssh => "SSH",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Self::Local),
            "HTTP" => Ok(Self::Http),
            "SSH" => Ok(Self::Ssh),
            _ => Err(ConfigurationError::invalid_value(
                "executor",
                s,
                "expected one of LOCAL, HTTP, SSH",
            )),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent directory of every simulation workdir
    pub data_path: PathBuf,

    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,

    pub worker_pool: WorkerPoolConfig,

    pub cli: StageExecutorConfig,

    pub analyzer: StageExecutorConfig,

    pub report: ReportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            database_url: None,
            worker_pool: WorkerPoolConfig::default(),
            cli: StageExecutorConfig::cli_defaults(),
            analyzer: StageExecutorConfig::analyzer_defaults(),
            report: ReportConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_path.as_os_str().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "data_path",
                "pipeline",
            ));
        }

        if self.worker_pool.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.max_concurrent_tasks",
                "0",
                "at least one task must be allowed to run",
            ));
        }

        self.cli.validate("cli")?;
        self.analyzer.validate("analyzer")?;
        self.report.validate()
    }
}

/// Executor selection and tuning for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageExecutorConfig {
    pub executor: ExecutorKind,
    pub polling_period_ms: u64,
    pub local: LocalExecutorConfig,
    pub http: HttpExecutorConfig,
    pub ssh: SshTunnelConfig,
}

impl Default for StageExecutorConfig {
    fn default() -> Self {
        Self::cli_defaults()
    }
}

impl StageExecutorConfig {
    pub fn cli_defaults() -> Self {
        Self {
            executor: ExecutorKind::Local,
            polling_period_ms: 1_000,
            local: LocalExecutorConfig::default(),
            http: HttpExecutorConfig::default(),
            ssh: SshTunnelConfig::default(),
        }
    }

    pub fn analyzer_defaults() -> Self {
        Self {
            executor: ExecutorKind::Http,
            polling_period_ms: 60_000,
            local: LocalExecutorConfig::analyzer_defaults(),
            ..Self::cli_defaults()
        }
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.polling_period_ms)
    }

    fn validate(&self, stage: &str) -> ConfigResult<()> {
        if self.polling_period_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{stage}.polling_period_ms"),
                "0",
                "polling period must be positive",
            ));
        }

        match self.executor {
            ExecutorKind::Local => self.local.validate(stage),
            ExecutorKind::Http => self.http.validate(stage),
            ExecutorKind::Ssh => {
                self.http.validate(stage)?;
                self.ssh.validate(stage)
            }
        }
    }
}

/// Subprocess executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExecutorConfig {
    pub binary_path: PathBuf,
    /// File name, relative to the workdir, receiving the binary's stdout
    pub output_file: String,
    /// Artifact type recorded for the output file
    pub output_file_type: String,
    /// Resource usage is sampled once per this many progress lines
    pub sample_every_lines: u64,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("bin/simbad-cli"),
            output_file: crate::constants::CLI_OUTPUT_FILE.to_string(),
            output_file_type: "CSV".to_string(),
            sample_every_lines: 10,
        }
    }
}

impl LocalExecutorConfig {
    /// A local analyzer writes under `output_data/` so it never overwrites its CSV input
    pub fn analyzer_defaults() -> Self {
        Self {
            binary_path: PathBuf::from("bin/simbad-analyzer"),
            output_file: format!(
                "{}/{}",
                crate::constants::ANALYZER_OUTPUT_DIR,
                crate::constants::ANALYZER_OUTPUT_FILE
            ),
            output_file_type: "PARQUET".to_string(),
            ..Self::default()
        }
    }

    fn validate(&self, stage: &str) -> ConfigResult<()> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "local.binary_path",
                stage,
            ));
        }
        if self.output_file.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "local.output_file",
                stage,
            ));
        }
        if self.sample_every_lines == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{stage}.local.sample_every_lines"),
                "0",
                "sampling interval must be positive",
            ));
        }
        self.output_file_type
            .parse::<crate::models::FileType>()
            .map(|_| ())
            .map_err(|reason| {
                ConfigurationError::invalid_value(
                    format!("{stage}.local.output_file_type"),
                    &self.output_file_type,
                    reason,
                )
            })
    }
}

/// Remote backend endpoints and request tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpExecutorConfig {
    pub start_endpoint: String,
    pub status_endpoint: String,
    pub runtime_endpoint: String,
    pub result_endpoint: String,
    pub request_timeout_ms: u64,
    /// Ask the status endpoint first and refuse to submit to a BUSY backend
    pub check_busy_before_submit: bool,
    /// Consecutive failed runtime polls tolerated before the step fails
    pub max_poll_failures: u32,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            start_endpoint: "http://127.0.0.1:5000/start".to_string(),
            status_endpoint: "http://127.0.0.1:5000/status".to_string(),
            runtime_endpoint: "http://127.0.0.1:5000/runtime".to_string(),
            result_endpoint: "http://127.0.0.1:5000/result".to_string(),
            request_timeout_ms: 30_000,
            check_busy_before_submit: false,
            max_poll_failures: 3,
        }
    }
}

impl HttpExecutorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self, stage: &str) -> ConfigResult<()> {
        for (field, value) in [
            ("http.start_endpoint", &self.start_endpoint),
            ("http.status_endpoint", &self.status_endpoint),
            ("http.runtime_endpoint", &self.runtime_endpoint),
            ("http.result_endpoint", &self.result_endpoint),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(field, stage));
            }
        }
        Ok(())
    }
}

/// SSH port forwarding used to reach a backend that only listens on the remote host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshTunnelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Local port the HTTP endpoints point at
    pub local_port: u16,
    /// Forwarding target, as seen from the SSH host
    pub remote_host: String,
    pub remote_port: u16,
    /// OpenSSH known_hosts file; `~/.ssh/known_hosts` when unset
    pub known_hosts_path: Option<PathBuf>,
    /// Trust a host key missing from known_hosts. Changed keys are rejected regardless.
    pub accept_unknown_host_keys: bool,
}

impl Default for SshTunnelConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: String::new(),
            local_port: 5000,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 5000,
            known_hosts_path: None,
            accept_unknown_host_keys: false,
        }
    }
}

impl SshTunnelConfig {
    fn validate(&self, stage: &str) -> ConfigResult<()> {
        if self.host.is_empty() {
            return Err(ConfigurationError::missing_required_field("ssh.host", stage));
        }
        if self.username.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "ssh.username",
                stage,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_concurrent_tasks: usize,
    /// Seconds a finished task stays visible to lookups
    pub task_retention_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            task_retention_secs: 3_600,
        }
    }
}

impl WorkerPoolConfig {
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

/// Report fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// External renderer invoked as `<command> plot <workdir> <parameter>` and
    /// `<command> report <workdir>`
    pub renderer_command: String,
    /// One plot job per parameter
    pub tracked_parameters: Vec<String>,
    /// Extra attempts per plot job after the first failure
    pub plot_retries: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            renderer_command: "simbad-reports".to_string(),
            tracked_parameters: crate::constants::DEFAULT_TRACKED_PARAMETERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            plot_retries: 2,
        }
    }
}

impl ReportConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.renderer_command.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "renderer_command",
                "report",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cli.executor, ExecutorKind::Local);
        assert_eq!(config.cli.polling_period(), Duration::from_secs(1));
        assert_eq!(config.analyzer.executor, ExecutorKind::Http);
        assert_eq!(config.analyzer.polling_period(), Duration::from_secs(60));
    }

    #[test]
    fn test_executor_kind_parsing() {
        assert_eq!("ssh".parse::<ExecutorKind>().unwrap(), ExecutorKind::Ssh);
        assert_eq!("LOCAL".parse::<ExecutorKind>().unwrap(), ExecutorKind::Local);
        assert!("grpc".parse::<ExecutorKind>().is_err());

        let kind: ExecutorKind = serde_json::from_str("\"HTTP\"").unwrap();
        assert_eq!(kind, ExecutorKind::Http);
    }

    #[test]
    fn test_validation_rejects_zero_polling_period() {
        let mut config = PipelineConfig::default();
        config.analyzer.polling_period_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("analyzer.polling_period_ms"));
    }

    #[test]
    fn test_ssh_requires_host() {
        let mut config = PipelineConfig::default();
        config.analyzer.executor = ExecutorKind::Ssh;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));

        config.analyzer.ssh.host = "analyzer.lab".to_string();
        config.analyzer.ssh.username = "simbad".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_analyzer_local_output_differs_from_cli_output() {
        let config = PipelineConfig::default();
        assert_ne!(config.analyzer.local.output_file, config.cli.local.output_file);
        assert!(config
            .analyzer
            .local
            .output_file
            .starts_with(crate::constants::ANALYZER_OUTPUT_DIR));

        let mut config = config;
        config.analyzer.executor = ExecutorKind::Local;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_output_file_type_rejected() {
        let mut config = PipelineConfig::default();
        config.cli.local.output_file_type = "XLSX".to_string();
        assert!(config.validate().is_err());
    }
}

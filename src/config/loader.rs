//! Configuration Loader
//!
//! Builds a [`PipelineConfig`] from the layered sources, validates it and keeps a
//! sanitized view around for logging.

use super::error::{ConfigResult, ConfigurationError};
use super::PipelineConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default location of the TOML file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/simbad.toml";

/// Environment variable pointing at an alternative TOML file
pub const CONFIG_PATH_ENV: &str = "SIMBAD_CONFIG";

/// Prefix of environment overrides, e.g. `SIMBAD__CLI__EXECUTOR=HTTP`
pub const ENV_PREFIX: &str = "SIMBAD";

const SENSITIVE_PATTERNS: [&str; 6] = [
    "password",
    "secret",
    "key",
    "token",
    "credential",
    "database_url",
];

pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `SIMBAD_CONFIG` or the default path, then the environment
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific TOML file; a missing file falls back to defaults
    pub fn load_from_path(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        debug!("Loading configuration from {}", path.display());

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("report.tracked_parameters"),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(path.display().to_string(), e))?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(path.display().to_string(), e))?;

        let source_path = path.exists().then(|| path.to_path_buf());
        Self::build(config, source_path)
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: PipelineConfig) -> ConfigResult<Arc<ConfigManager>> {
        Self::build(config, None)
    }

    fn build(
        config: PipelineConfig,
        source_path: Option<PathBuf>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;

        let environment = crate::logging::get_environment();
        let sanitized = sanitize_config_for_logging(&config);
        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&sanitized)
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        tracing::info!(
            environment = %environment,
            cli_executor = %config.cli.executor,
            analyzer_executor = %config.analyzer.executor,
            data_path = %config.data_path.display(),
            "⚙️ CONFIG: Pipeline configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            source_path,
        }))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The TOML file the configuration was read from, if one existed
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Configuration as JSON with secrets masked
    pub fn debug_config(&self) -> serde_json::Value {
        sanitize_config_for_logging(&self.config)
    }
}

impl PipelineConfig {
    /// JSON view of the configuration safe to log
    pub fn sanitized(&self) -> serde_json::Value {
        sanitize_config_for_logging(self)
    }
}

fn sanitize_config_for_logging(config: &PipelineConfig) -> serde_json::Value {
    let mut config_json = serde_json::json!(config);
    sanitize_json_recursive(&mut config_json, &SENSITIVE_PATTERNS);
    config_json
}

/// Recursively mask fields whose name matches one of the sensitive patterns
fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = sensitive_patterns
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if is_sensitive {
                    match val {
                        serde_json::Value::Null | serde_json::Value::Bool(_) => {}
                        serde_json::Value::String(s) if s.is_empty() => {
                            *val = serde_json::Value::String("[EMPTY]".to_string());
                        }
                        serde_json::Value::String(s) => {
                            let masked = if s.chars().count() > 4 {
                                let head: String = s.chars().take(2).collect();
                                let tail: String = s
                                    .chars()
                                    .rev()
                                    .take(2)
                                    .collect::<Vec<_>>()
                                    .into_iter()
                                    .rev()
                                    .collect();
                                format!("{head}***{tail}")
                            } else {
                                "***".to_string()
                            };
                            *val = serde_json::Value::String(format!("[MASKED: {masked}]"));
                        }
                        _ => {
                            *val = serde_json::Value::String("[MASKED]".to_string());
                        }
                    }
                } else {
                    sanitize_json_recursive(val, sensitive_patterns);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_json_recursive(item, sensitive_patterns);
            }
        }
        _ => {}
    }
}

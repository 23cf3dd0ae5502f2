//! # Pipeline Constants
//!
//! Filesystem layout shared by the orchestrator, the executors and the report renderer.
//! Every path is relative to a simulation's workdir (`{data_path}/SIM_{id}`).

/// Prefix of a simulation workdir name
pub const WORKDIR_PREFIX: &str = "SIM_";

/// Stdout of the simulator binary
pub const CLI_OUTPUT_FILE: &str = "cli_out.csv";

/// Artifact name recorded for the simulator output
pub const CLI_OUTPUT_NAME: &str = "cli_out";

/// Analyzer outputs (parquet datasets)
pub const ANALYZER_OUTPUT_DIR: &str = "output_data";

/// Output of a locally run analyzer, inside [`ANALYZER_OUTPUT_DIR`]
pub const ANALYZER_OUTPUT_FILE: &str = "analyzer_out.parquet";

pub const PLOTS_DIR: &str = "plots";

pub const REPORTS_DIR: &str = "reports";

pub const REPORT_FILE: &str = "simulation_report.pdf";

pub const LOGS_DIR: &str = "logs";

pub const CONFIGURATION_EXTENSION: &str = "json";

/// Step error message recorded when a stage is revoked
pub const REVOKED_MESSAGE: &str = "revoked";

/// Parameters plotted by the report stage unless configured otherwise
pub const DEFAULT_TRACKED_PARAMETERS: [&str; 10] = [
    "normalized_entropy",
    "cloneCount",
    "systemSize",
    "entropy",
    "birth_efficiency",
    "birth_resistance",
    "lifespan_efficiency",
    "lifespan_resistance",
    "success_efficiency",
    "success_resistance",
];

/// Worker-pool task names, one per stage
pub mod tasks {
    pub const CLI: &str = "SIMBAD-CLI";
    pub const ANALYZER: &str = "SIMBAD-ANALYZER";
    pub const REPORT: &str = "SIMBAD-REPORTS";
    pub const PLOT: &str = "SIMBAD-PLOT";
}

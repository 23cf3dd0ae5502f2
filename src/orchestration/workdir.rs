//! Simulation setup: the CONF stage.
//!
//! Creates the simulation record and its first step, lays out `{data_path}/SIM_{id}` with
//! a `logs/` directory, writes the configuration as pretty-printed JSON and registers it
//! as the step's artifact. The step is created with origin CLI so the CLI stage adopts it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::constants::{CONFIGURATION_EXTENSION, LOGS_DIR, WORKDIR_PREFIX};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_simulation_operation;
use crate::models::{Artifact, FileType, NewArtifact, NewSimulation, Simulation, Step};
use crate::state_machine::PipelineStage;
use crate::store::PipelineStore;

/// Inbound request to start a simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub configuration_name: String,
    pub configuration: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
}

/// Records created by setup
#[derive(Debug, Clone)]
pub struct SimulationSetup {
    pub simulation: Simulation,
    pub step: Step,
    pub configuration: Artifact,
    pub workdir: PathBuf,
}

/// `demo` → `demo.json`; names that would escape the workdir are rejected
pub fn normalize_configuration_name(name: &str) -> PipelineResult<String> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(PipelineError::Workdir(format!(
            "invalid configuration name {name:?}"
        )));
    }

    let suffix = format!(".{CONFIGURATION_EXTENSION}");
    if name.to_ascii_lowercase().ends_with(&suffix) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}{suffix}"))
    }
}

pub fn simulation_workdir(data_path: &Path, simulation_id: i64) -> PathBuf {
    data_path.join(format!("{WORKDIR_PREFIX}{simulation_id}"))
}

#[instrument(skip(store, request), fields(configuration = %request.configuration_name))]
pub async fn setup_simulation(
    store: &dyn PipelineStore,
    data_path: &Path,
    request: SimulationRequest,
) -> PipelineResult<SimulationSetup> {
    let configuration_name = normalize_configuration_name(&request.configuration_name)?;
    let display_name = request.name.clone().unwrap_or_else(|| {
        configuration_name
            .trim_end_matches(&format!(".{CONFIGURATION_EXTENSION}"))
            .to_string()
    });

    let (simulation, step) = store
        .create_simulation(NewSimulation::new(display_name, PipelineStage::Cli))
        .await?;
    let workdir = simulation_workdir(data_path, simulation.simulation_id);

    let written =
        write_configuration(&workdir, &configuration_name, &request.configuration).await;
    let configuration = match written {
        Ok(path) => {
            let artifact = NewArtifact::from_file(
                simulation.simulation_id,
                step.step_id,
                &path,
                Some(FileType::Json),
            );
            store
                .register_configuration(
                    simulation.simulation_id,
                    &workdir.to_string_lossy(),
                    artifact,
                )
                .await?
        }
        Err(error) => {
            store.fail_step(step.step_id, &error.to_string(), None).await?;
            return Err(error);
        }
    };

    log_simulation_operation(
        "setup",
        Some(simulation.simulation_id),
        Some(&simulation.name),
        "created",
        Some(&workdir.to_string_lossy()),
    );

    let simulation = store.simulation(simulation.simulation_id).await?;
    Ok(SimulationSetup {
        simulation,
        step,
        configuration,
        workdir,
    })
}

async fn write_configuration(
    workdir: &Path,
    configuration_name: &str,
    configuration: &serde_json::Value,
) -> PipelineResult<PathBuf> {
    tokio::fs::create_dir_all(workdir.join(LOGS_DIR)).await?;
    let path = workdir.join(configuration_name);
    let contents = serde_json::to_vec_pretty(configuration)?;
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StepStatus;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[test]
    fn test_normalize_configuration_name() {
        assert_eq!(normalize_configuration_name("demo").unwrap(), "demo.json");
        assert_eq!(normalize_configuration_name("demo.json").unwrap(), "demo.json");
        assert_eq!(normalize_configuration_name(" run-2.JSON ").unwrap(), "run-2.JSON");
        assert!(normalize_configuration_name("../etc/passwd").is_err());
        assert!(normalize_configuration_name("").is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let request: SimulationRequest = serde_json::from_value(json!({
            "configurationName": "demo",
            "configuration": {"parameters": {"mutations": 3}}
        }))
        .unwrap();
        assert_eq!(request.configuration_name, "demo");
        assert!(request.name.is_none());
    }

    #[tokio::test]
    async fn test_setup_creates_workdir_and_artifact() {
        let data = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let request = SimulationRequest {
            configuration_name: "demo".to_string(),
            configuration: json!({"parameters": {"mutations": 3}}),
            name: None,
        };

        let setup = setup_simulation(&store, data.path(), request).await.unwrap();

        assert_eq!(setup.simulation.name, "demo");
        assert_eq!(setup.step.status, StepStatus::Ongoing);
        assert_eq!(setup.step.origin, PipelineStage::Cli);
        assert_eq!(setup.configuration.file_type, FileType::Json);
        assert!(setup.configuration.size_bytes > 0);
        assert!(setup.workdir.join(LOGS_DIR).is_dir());
        assert_eq!(
            setup.workdir,
            data.path().join(format!("SIM_{}", setup.simulation.simulation_id))
        );
        assert_eq!(
            setup.simulation.workdir.as_deref(),
            Some(setup.workdir.to_string_lossy().as_ref())
        );

        let raw = std::fs::read(setup.workdir.join("demo.json")).unwrap();
        let written: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(written["parameters"]["mutations"], 3);
    }
}

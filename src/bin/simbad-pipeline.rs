//! SIMBAD Pipeline Binary
//!
//! Runs one simulation to completion:
//!
//! ```bash
//! simbad-pipeline request.json
//! ```
//!
//! `request.json` holds `{"configurationName": ..., "configuration": {...}}`. The final
//! simulation record, with its steps, is printed as JSON. Ctrl-C revokes the running chain.

use anyhow::{bail, Context};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use simbad_pipeline::config::ConfigManager;
use simbad_pipeline::logging::init_structured_logging;
use simbad_pipeline::orchestration::{Orchestrator, SimulationRequest};
use simbad_pipeline::store::{InMemoryStore, PgStore, PipelineStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let Some(request_path) = std::env::args().nth(1) else {
        bail!("usage: simbad-pipeline <request.json>");
    };

    let manager = ConfigManager::load().context("failed to load configuration")?;
    let config = manager.config().clone();

    let store: Arc<dyn PipelineStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url, config.worker_pool.max_concurrent_tasks as u32 + 1)
                .await
                .context("failed to connect to the database")?,
        ),
        None => {
            warn!("No database_url configured, using the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let request: SimulationRequest = serde_json::from_slice(
        &tokio::fs::read(&request_path)
            .await
            .with_context(|| format!("failed to read {request_path}"))?,
    )
    .with_context(|| format!("{request_path} is not a simulation request"))?;

    let orchestrator = Orchestrator::with_command_renderer(config, store);
    let run = orchestrator.submit(request).await?;
    let simulation_id = run.simulation_id;
    info!(simulation_id, "Simulation submitted");

    let mut join = run.join;
    let outcome = tokio::select! {
        joined = &mut join => joined,
        _ = signal::ctrl_c() => {
            info!(simulation_id, "Shutdown signal received, revoking simulation");
            orchestrator.revoke_simulation(simulation_id);
            join.await
        }
    };

    let chain_error = match outcome.context("simulation chain panicked")? {
        Ok(outcome) => {
            info!(simulation_id, revoked_at = ?outcome.revoked_at, "Simulation chain ended");
            None
        }
        Err(error) => Some(error),
    };

    let status = orchestrator.simulation_status(simulation_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if let Some(error) = chain_error {
        bail!("simulation {simulation_id} failed: {error}");
    }
    Ok(())
}

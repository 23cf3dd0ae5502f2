//! Postgres pipeline store.
//!
//! Each operation runs in its own `sqlx` transaction. `begin_step` locks the simulation
//! row before inspecting its steps, and the partial unique index on
//! `steps (simulation_id) WHERE status = 'ONGOING'` backs the one-ongoing-step rule at
//! the schema level.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgConnection;
use tracing::{debug, instrument};

use super::PipelineStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{Artifact, NewArtifact, NewSimulation, RuntimeInfo, Simulation, Step};
use crate::state_machine::{PipelineStage, StepEvent, StepStateMachine, StepStatus};

const SIMULATION_COLUMNS: &str =
    "simulation_id, name, started_at, finished_at, current_step, current_step_id, workdir";
const STEP_COLUMNS: &str =
    "step_id, simulation_id, started_at, finished_at, origin, status, error_message, task_handle";
const ARTIFACT_COLUMNS: &str =
    "artifact_id, simulation_id, step_id, created_at, size_bytes, path, name, file_type";

#[derive(Debug, sqlx::FromRow)]
struct SimulationRow {
    simulation_id: i64,
    name: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    current_step: String,
    current_step_id: Option<i64>,
    workdir: Option<String>,
}

impl TryFrom<SimulationRow> for Simulation {
    type Error = StoreError;

    fn try_from(row: SimulationRow) -> Result<Self, Self::Error> {
        Ok(Simulation {
            simulation_id: row.simulation_id,
            name: row.name,
            started_at: row.started_at,
            finished_at: row.finished_at,
            current_step: row.current_step.parse().map_err(StoreError::Database)?,
            current_step_id: row.current_step_id,
            workdir: row.workdir,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepRow {
    step_id: i64,
    simulation_id: i64,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    origin: String,
    status: String,
    error_message: Option<String>,
    task_handle: Option<String>,
}

impl TryFrom<StepRow> for Step {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            step_id: row.step_id,
            simulation_id: row.simulation_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            origin: row.origin.parse().map_err(StoreError::Database)?,
            status: row.status.parse().map_err(StoreError::Database)?,
            error_message: row.error_message,
            task_handle: row.task_handle,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtifactRow {
    artifact_id: i64,
    simulation_id: i64,
    step_id: i64,
    created_at: DateTime<Utc>,
    size_bytes: i64,
    path: String,
    name: String,
    file_type: String,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = StoreError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Artifact {
            artifact_id: row.artifact_id,
            simulation_id: row.simulation_id,
            step_id: row.step_id,
            created_at: row.created_at,
            size_bytes: row.size_bytes,
            path: row.path,
            name: row.name,
            file_type: row.file_type.parse().map_err(StoreError::Database)?,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn fetch_simulation(
    conn: &mut PgConnection,
    simulation_id: i64,
    lock: bool,
) -> StoreResult<Simulation> {
    let sql = format!(
        "SELECT {SIMULATION_COLUMNS} FROM simulations WHERE simulation_id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, SimulationRow>(&sql)
        .bind(simulation_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("simulation", simulation_id))?
        .try_into()
}

async fn fetch_step(conn: &mut PgConnection, step_id: i64, lock: bool) -> StoreResult<Step> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE step_id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, StepRow>(&sql)
        .bind(step_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("step", step_id))?
        .try_into()
}

async fn insert_step(
    conn: &mut PgConnection,
    simulation_id: i64,
    origin: PipelineStage,
    started_at: DateTime<Utc>,
) -> StoreResult<Step> {
    let sql = format!(
        "INSERT INTO steps (simulation_id, started_at, origin, status) \
         VALUES ($1, $2, $3, $4) RETURNING {STEP_COLUMNS}"
    );
    sqlx::query_as::<_, StepRow>(&sql)
        .bind(simulation_id)
        .bind(started_at)
        .bind(origin.as_str())
        .bind(StepStatus::Ongoing.as_str())
        .fetch_one(&mut *conn)
        .await?
        .try_into()
}

async fn insert_artifacts(
    conn: &mut PgConnection,
    step: &Step,
    artifacts: Vec<NewArtifact>,
) -> StoreResult<Vec<Artifact>> {
    let sql = format!(
        "INSERT INTO artifacts \
         (simulation_id, step_id, created_at, size_bytes, path, name, file_type) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {ARTIFACT_COLUMNS}"
    );
    let mut persisted = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let artifact = artifact.for_step(step.simulation_id, step.step_id);
        let row = sqlx::query_as::<_, ArtifactRow>(&sql)
            .bind(artifact.simulation_id)
            .bind(artifact.step_id)
            .bind(artifact.created_at)
            .bind(artifact.size_bytes)
            .bind(&artifact.path)
            .bind(&artifact.name)
            .bind(artifact.file_type.as_str())
            .fetch_one(&mut *conn)
            .await?;
        persisted.push(row.try_into()?);
    }
    Ok(persisted)
}

async fn upsert_runtime_info(
    conn: &mut PgConnection,
    step_id: i64,
    info: &RuntimeInfo,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO step_runtime_info (step_id, info, updated_at) VALUES ($1, $2, $3) \
         ON CONFLICT (step_id) \
         DO UPDATE SET info = EXCLUDED.info, updated_at = EXCLUDED.updated_at",
    )
    .bind(step_id)
    .bind(Json(info))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn close_step(
    conn: &mut PgConnection,
    step_id: i64,
    event: &StepEvent,
    final_runtime_info: Option<&RuntimeInfo>,
) -> StoreResult<Step> {
    let current = fetch_step(conn, step_id, true).await?;
    let target = StepStateMachine::transition(current.status, event)?;

    let sql = format!(
        "UPDATE steps SET status = $2, finished_at = $3, error_message = $4 \
         WHERE step_id = $1 RETURNING {STEP_COLUMNS}"
    );
    let step: Step = sqlx::query_as::<_, StepRow>(&sql)
        .bind(step_id)
        .bind(target.as_str())
        .bind(Utc::now())
        .bind(event.error_message())
        .fetch_one(&mut *conn)
        .await?
        .try_into()?;

    if let Some(info) = final_runtime_info {
        upsert_runtime_info(conn, step_id, info).await?;
    }
    Ok(step)
}

#[async_trait]
impl PipelineStore for PgStore {
    #[instrument(skip(self, new_simulation), fields(name = %new_simulation.name))]
    async fn create_simulation(
        &self,
        new_simulation: NewSimulation,
    ) -> StoreResult<(Simulation, Step)> {
        let mut tx = self.pool.begin().await?;

        let simulation_id: i64 = sqlx::query_scalar(
            "INSERT INTO simulations (name, started_at, current_step) VALUES ($1, $2, $3) \
             RETURNING simulation_id",
        )
        .bind(&new_simulation.name)
        .bind(new_simulation.started_at)
        .bind(new_simulation.initial_stage.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let step = insert_step(
            &mut tx,
            simulation_id,
            new_simulation.initial_stage,
            new_simulation.started_at,
        )
        .await?;

        sqlx::query("UPDATE simulations SET current_step_id = $2 WHERE simulation_id = $1")
            .bind(simulation_id)
            .bind(step.step_id)
            .execute(&mut *tx)
            .await?;

        let simulation = fetch_simulation(&mut tx, simulation_id, false).await?;
        tx.commit().await?;

        debug!(simulation_id, step_id = step.step_id, "Created simulation");
        Ok((simulation, step))
    }

    async fn register_configuration(
        &self,
        simulation_id: i64,
        workdir: &str,
        artifact: NewArtifact,
    ) -> StoreResult<Artifact> {
        let mut tx = self.pool.begin().await?;
        let simulation = fetch_simulation(&mut tx, simulation_id, true).await?;
        let step_id = simulation
            .current_step_id
            .ok_or_else(|| StoreError::not_found("step for simulation", simulation_id))?;
        let step = fetch_step(&mut tx, step_id, false).await?;

        sqlx::query("UPDATE simulations SET workdir = $2 WHERE simulation_id = $1")
            .bind(simulation_id)
            .bind(workdir)
            .execute(&mut *tx)
            .await?;
        let mut persisted = insert_artifacts(&mut tx, &step, vec![artifact]).await?;
        tx.commit().await?;

        persisted.pop().ok_or_else(|| {
            StoreError::Database("configuration artifact was not stored".to_string())
        })
    }

    #[instrument(skip(self, initial))]
    async fn begin_step(
        &self,
        simulation_id: i64,
        origin: PipelineStage,
        initial: RuntimeInfo,
    ) -> StoreResult<Step> {
        let mut tx = self.pool.begin().await?;
        fetch_simulation(&mut tx, simulation_id, true).await?;

        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE simulation_id = $1 AND status = $2"
        );
        let ongoing: Option<Step> = sqlx::query_as::<_, StepRow>(&sql)
            .bind(simulation_id)
            .bind(StepStatus::Ongoing.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(Step::try_from)
            .transpose()?;

        let step = match ongoing {
            Some(step) if step.origin == origin => step,
            Some(step) => {
                return Err(StoreError::StepAlreadyOngoing {
                    simulation_id,
                    step_id: step.step_id,
                })
            }
            None => insert_step(&mut tx, simulation_id, origin, Utc::now()).await?,
        };

        upsert_runtime_info(&mut tx, step.step_id, &initial).await?;
        sqlx::query(
            "UPDATE simulations SET current_step = $2, current_step_id = $3 \
             WHERE simulation_id = $1",
        )
        .bind(simulation_id)
        .bind(origin.as_str())
        .bind(step.step_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(step)
    }

    async fn set_task_handle(&self, step_id: i64, task_handle: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE steps SET task_handle = $2 WHERE step_id = $1")
            .bind(step_id)
            .bind(task_handle)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("step", step_id));
        }
        Ok(())
    }

    async fn update_runtime_info(
        &self,
        step_id: i64,
        runtime_info: &RuntimeInfo,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        fetch_step(&mut tx, step_id, false).await?;
        upsert_runtime_info(&mut tx, step_id, runtime_info).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(
        skip(self, artifacts, final_runtime_info),
        fields(artifact_count = artifacts.len())
    )]
    async fn complete_step(
        &self,
        step_id: i64,
        artifacts: Vec<NewArtifact>,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Vec<Artifact>> {
        let mut tx = self.pool.begin().await?;
        let step = close_step(
            &mut tx,
            step_id,
            &StepEvent::Complete,
            final_runtime_info.as_ref(),
        )
        .await?;
        let persisted = insert_artifacts(&mut tx, &step, artifacts).await?;
        tx.commit().await?;
        Ok(persisted)
    }

    async fn fail_step(
        &self,
        step_id: i64,
        error_message: &str,
        final_runtime_info: Option<RuntimeInfo>,
    ) -> StoreResult<Step> {
        let mut tx = self.pool.begin().await?;
        let step = close_step(
            &mut tx,
            step_id,
            &StepEvent::fail_with_error(error_message),
            final_runtime_info.as_ref(),
        )
        .await?;
        tx.commit().await?;
        Ok(step)
    }

    async fn finish_simulation(&self, simulation_id: i64) -> StoreResult<Simulation> {
        let sql = format!(
            "UPDATE simulations SET finished_at = $2, current_step = $3 \
             WHERE simulation_id = $1 RETURNING {SIMULATION_COLUMNS}"
        );
        sqlx::query_as::<_, SimulationRow>(&sql)
            .bind(simulation_id)
            .bind(Utc::now())
            .bind(PipelineStage::Finished.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("simulation", simulation_id))?
            .try_into()
    }

    async fn simulation(&self, simulation_id: i64) -> StoreResult<Simulation> {
        let mut conn = self.pool.acquire().await?;
        fetch_simulation(&mut conn, simulation_id, false).await
    }

    async fn step(&self, step_id: i64) -> StoreResult<Step> {
        let mut conn = self.pool.acquire().await?;
        fetch_step(&mut conn, step_id, false).await
    }

    async fn artifact(&self, artifact_id: i64) -> StoreResult<Artifact> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE artifact_id = $1");
        sqlx::query_as::<_, ArtifactRow>(&sql)
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("artifact", artifact_id))?
            .try_into()
    }

    async fn steps_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Step>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE simulation_id = $1 ORDER BY step_id"
        );
        let rows = sqlx::query_as::<_, StepRow>(&sql)
            .bind(simulation_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn artifacts_for_step(&self, step_id: i64) -> StoreResult<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE step_id = $1 ORDER BY artifact_id"
        );
        let rows = sqlx::query_as::<_, ArtifactRow>(&sql)
            .bind(step_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn artifacts_for_simulation(&self, simulation_id: i64) -> StoreResult<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE simulation_id = $1 ORDER BY artifact_id"
        );
        let rows = sqlx::query_as::<_, ArtifactRow>(&sql)
            .bind(simulation_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn runtime_info(&self, step_id: i64) -> StoreResult<Option<RuntimeInfo>> {
        let info: Option<Json<RuntimeInfo>> =
            sqlx::query_scalar("SELECT info FROM step_runtime_info WHERE step_id = $1")
                .bind(step_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(info.map(|Json(info)| info))
    }

    async fn current_simulation(&self) -> StoreResult<Option<Simulation>> {
        let sql = format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulations s \
             WHERE EXISTS (SELECT 1 FROM steps st \
                           WHERE st.simulation_id = s.simulation_id AND st.status = $1) \
             ORDER BY s.simulation_id DESC LIMIT 1"
        );
        sqlx::query_as::<_, SimulationRow>(&sql)
            .bind(StepStatus::Ongoing.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Simulation::try_from)
            .transpose()
    }

    async fn latest_simulation(&self) -> StoreResult<Option<Simulation>> {
        let sql = format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulations ORDER BY simulation_id DESC LIMIT 1"
        );
        sqlx::query_as::<_, SimulationRow>(&sql)
            .fetch_optional(&self.pool)
            .await?
            .map(Simulation::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn test_step_lifecycle(pool: PgPool) {
        let store = PgStore::new(pool);
        let (simulation, step) = store
            .create_simulation(NewSimulation::new("demo", PipelineStage::Cli))
            .await
            .unwrap();
        assert_eq!(simulation.current_step_id, Some(step.step_id));

        let err = store
            .begin_step(
                simulation.simulation_id,
                PipelineStage::Analyzer,
                RuntimeInfo::initial(PipelineStage::Analyzer),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StepAlreadyOngoing { .. }));

        store.complete_step(step.step_id, vec![], None).await.unwrap();
        let err = store.fail_step(step.step_id, "late", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn test_runtime_info_roundtrip(pool: PgPool) {
        let store = PgStore::new(pool);
        let (_, step) = store
            .create_simulation(NewSimulation::new("demo", PipelineStage::Cli))
            .await
            .unwrap();
        let info = RuntimeInfo::initial(PipelineStage::Cli);
        store.update_runtime_info(step.step_id, &info).await.unwrap();
        assert_eq!(store.runtime_info(step.step_id).await.unwrap(), Some(info));
    }
}

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::domain::run::{RunId, RunState};
use crate::pipeline::ledger::{RunLedger, RunRecord};

const SELECT_COLUMNS: &str = "SELECT pipeline, run_id, logical_time, state, failed_stage, error_kind, error, \
     started_at, updated_at, raw_object_key, transformed_object_key, record_count \
     FROM pipeline_runs";

type RunRow = (
    String,
    String,
    DateTime<Utc>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<String>,
    Option<String>,
    Option<i64>,
);

/// Run ledger backed by the `pipeline_runs` table.
#[derive(Debug, Clone)]
pub struct PgRunLedger {
    pool: sqlx::PgPool,
}

impl PgRunLedger {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

fn failure_columns(state: &RunState) -> (Option<&'static str>, Option<&'static str>, Option<&str>) {
    match state {
        RunState::Failed { stage, kind, cause } => {
            (Some(stage.as_str()), Some(kind.as_str()), Some(cause.as_str()))
        }
        _ => (None, None, None),
    }
}

fn from_row(row: RunRow) -> anyhow::Result<RunRecord> {
    let (
        pipeline,
        run_id,
        logical_time,
        state,
        failed_stage,
        error_kind,
        error,
        started_at,
        updated_at,
        raw_object_key,
        transformed_object_key,
        record_count,
    ) = row;

    let run_id = RunId::parse(&run_id).with_context(|| format!("stored run id {run_id:?}"))?;
    let state = RunState::from_parts(
        &state,
        failed_stage.as_deref(),
        error_kind.as_deref(),
        error.as_deref(),
    )
    .with_context(|| format!("unrecognized stored state {state:?} for run {run_id}"))?;

    Ok(RunRecord {
        pipeline,
        run_id,
        logical_time,
        state,
        started_at,
        updated_at,
        raw_object_key,
        transformed_object_key,
        record_count,
    })
}

#[async_trait::async_trait]
impl RunLedger for PgRunLedger {
    async fn record(&self, record: &RunRecord) -> anyhow::Result<()> {
        let (failed_stage, error_kind, error) = failure_columns(&record.state);

        // started_at keeps its first value across resumptions of the same run.
        sqlx::query(
            "INSERT INTO pipeline_runs (pipeline, run_id, logical_time, state, failed_stage, error_kind, error, \
                 started_at, updated_at, raw_object_key, transformed_object_key, record_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (pipeline, run_id) DO UPDATE \
               SET state = EXCLUDED.state, failed_stage = EXCLUDED.failed_stage, \
                   error_kind = EXCLUDED.error_kind, error = EXCLUDED.error, \
                   updated_at = EXCLUDED.updated_at, raw_object_key = EXCLUDED.raw_object_key, \
                   transformed_object_key = EXCLUDED.transformed_object_key, \
                   record_count = EXCLUDED.record_count",
        )
        .persistent(false)
        .bind(&record.pipeline)
        .bind(record.run_id.as_str())
        .bind(record.logical_time)
        .bind(record.state.label())
        .bind(failed_stage)
        .bind(error_kind)
        .bind(error)
        .bind(record.started_at)
        .bind(record.updated_at)
        .bind(&record.raw_object_key)
        .bind(&record.transformed_object_key)
        .bind(record.record_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert pipeline_runs failed (run_id={})", record.run_id))?;
        Ok(())
    }

    async fn get(&self, pipeline: &str, run_id: &RunId) -> anyhow::Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "{SELECT_COLUMNS} WHERE pipeline = $1 AND run_id = $2"
        ))
        .persistent(false)
        .bind(pipeline)
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("select pipeline_runs failed")?;

        row.map(from_row).transpose()
    }

    async fn recent(&self, pipeline: &str, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "{SELECT_COLUMNS} WHERE pipeline = $1 ORDER BY logical_time DESC LIMIT $2"
        ))
        .persistent(false)
        .bind(pipeline)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("list pipeline_runs failed")?;

        rows.into_iter().map(from_row).collect()
    }
}

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::{RunContext, RunId, RunState};

/// Status of one run as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pipeline: String,
    pub run_id: RunId,
    pub logical_time: DateTime<Utc>,
    #[serde(flatten)]
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub raw_object_key: Option<String>,
    pub transformed_object_key: Option<String>,
    pub record_count: Option<i64>,
}

impl RunRecord {
    pub fn scheduled(ctx: &RunContext, now: DateTime<Utc>) -> Self {
        Self {
            pipeline: ctx.pipeline.clone(),
            run_id: ctx.run_id.clone(),
            logical_time: ctx.logical_time,
            state: RunState::Scheduled,
            started_at: now,
            updated_at: now,
            raw_object_key: None,
            transformed_object_key: None,
            record_count: None,
        }
    }
}

#[async_trait::async_trait]
pub trait RunLedger: Send + Sync {
    /// Inserts or replaces the record for `(pipeline, run_id)`.
    async fn record(&self, record: &RunRecord) -> anyhow::Result<()>;

    async fn get(&self, pipeline: &str, run_id: &RunId) -> anyhow::Result<Option<RunRecord>>;

    /// Most recent runs first.
    async fn recent(&self, pipeline: &str, limit: usize) -> anyhow::Result<Vec<RunRecord>>;
}

const DEFAULT_RETAINED_RUNS: usize = 1000;

/// Process-local ledger, used when no database is configured and in tests.
/// Keeps only the newest runs of each pipeline.
#[derive(Debug)]
pub struct MemoryRunLedger {
    runs: Mutex<BTreeMap<(String, RunId), RunRecord>>,
    retain: usize,
}

impl Default for MemoryRunLedger {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            runs: Mutex::new(BTreeMap::new()),
            retain: retain.max(1),
        }
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, BTreeMap<(String, RunId), RunRecord>>> {
        self.runs
            .lock()
            .map_err(|_| anyhow::anyhow!("run ledger mutex poisoned"))
    }
}

#[async_trait::async_trait]
impl RunLedger for MemoryRunLedger {
    async fn record(&self, record: &RunRecord) -> anyhow::Result<()> {
        let mut runs = self.lock()?;
        runs.insert(
            (record.pipeline.clone(), record.run_id.clone()),
            record.clone(),
        );

        // Keys sort by run id within a pipeline, so the first ones are the oldest.
        let held: Vec<(String, RunId)> = runs
            .keys()
            .filter(|(pipeline, _)| *pipeline == record.pipeline)
            .cloned()
            .collect();
        if held.len() > self.retain {
            for key in &held[..held.len() - self.retain] {
                runs.remove(key);
            }
        }
        Ok(())
    }

    async fn get(&self, pipeline: &str, run_id: &RunId) -> anyhow::Result<Option<RunRecord>> {
        Ok(self
            .lock()?
            .get(&(pipeline.to_string(), run_id.clone()))
            .cloned())
    }

    async fn recent(&self, pipeline: &str, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
        Ok(self
            .lock()?
            .values()
            .rev()
            .filter(|r| r.pipeline == pipeline)
            .take(limit)
            .cloned()
            .collect())
    }
}

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Settings;
use crate::domain::run::{RunContext, RunState, Stage};
use crate::error::StageError;
use crate::ingest::fetcher::Fetcher;
use crate::ingest::provider::SnapshotSource;
use crate::ingest::types::SourceQuery;
use crate::pipeline::ledger::{RunLedger, RunRecord};
use crate::publish::sink::{ObjectKey, ObjectSink};
use crate::publish::Publisher;
use crate::staging::{ArtifactKind, StagedArtifact, StagingArea};
use crate::transform::{read_records, Transformer};

const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.stage_retries,
            base_backoff: settings.stage_retry_backoff,
        }
    }

    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt.saturating_sub(1)).min(MAX_BACKOFF_SHIFT))
    }
}

type StageFailure = (Stage, StageError);

/// Drives one run through fetch, container check, raw upload, transform and
/// transformed upload, recording every transition in the ledger.
pub struct PipelineController {
    fetcher: Fetcher,
    transformer: Transformer,
    publisher: Publisher,
    staging: StagingArea,
    ledger: Arc<dyn RunLedger>,
    retry: RetryPolicy,
}

impl PipelineController {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        query: SourceQuery,
        sink: Arc<dyn ObjectSink>,
        staging: StagingArea,
        ledger: Arc<dyn RunLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fetcher: Fetcher::new(source, query, staging.clone()),
            transformer: Transformer::new(staging.clone()),
            publisher: Publisher::new(sink, staging.clone()),
            staging,
            ledger,
            retry,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn ObjectSink>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self::new(
            source,
            SourceQuery::from_settings(settings),
            sink,
            StagingArea::new(&settings.staging_dir),
            ledger,
            RetryPolicy::from_settings(settings),
        )
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Executes (or resumes) the run and returns its final record. Artifacts
    /// already staged for this run are reused, so replaying a run converges
    /// on the same published objects.
    pub async fn run(&self, ctx: &RunContext) -> RunRecord {
        let mut record = RunRecord::scheduled(ctx, Utc::now());
        self.save(&record).await;

        match self.staging.sweep_run(ctx).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(run_id = %ctx.run_id, removed, "swept stale temp files"),
            Err(err) => tracing::warn!(run_id = %ctx.run_id, error = %err, "temp file sweep failed"),
        }

        tracing::info!(pipeline = %ctx.pipeline, run_id = %ctx.run_id, "pipeline run started");

        match self.drive(ctx, &mut record).await {
            Ok(()) => {
                tracing::info!(
                    pipeline = %ctx.pipeline,
                    run_id = %ctx.run_id,
                    rows = record.record_count,
                    "pipeline run complete"
                );
            }
            Err((stage, err)) => {
                record.state = RunState::fail(stage, &err);
                record.updated_at = Utc::now();
                self.save(&record).await;
                tracing::error!(
                    pipeline = %ctx.pipeline,
                    run_id = %ctx.run_id,
                    %stage,
                    kind = %err.kind(),
                    error = %err,
                    "pipeline run failed"
                );
            }
        }

        record
    }

    async fn drive(&self, ctx: &RunContext, record: &mut RunRecord) -> Result<(), StageFailure> {
        self.transition(record, Stage::Fetch, RunState::begin).await?;
        let staged_raw = self
            .staging
            .existing(ctx, ArtifactKind::Raw)
            .await
            .map_err(|e| (Stage::Fetch, e))?;
        if staged_raw.is_some() {
            tracing::info!(run_id = %ctx.run_id, "reusing staged raw snapshot");
        } else {
            self.attempt(ctx, Stage::Fetch, || self.fetcher.fetch(ctx))
                .await?;
        }
        self.transition(record, Stage::Fetch, RunState::finish).await?;

        self.transition(record, Stage::EnsureContainer, RunState::begin)
            .await?;
        self.attempt(ctx, Stage::EnsureContainer, || {
            self.publisher.ensure_container()
        })
        .await?;
        self.transition(record, Stage::EnsureContainer, RunState::finish)
            .await?;

        let raw = self.require(ctx, Stage::PublishRaw, ArtifactKind::Raw).await?;
        self.transition(record, Stage::PublishRaw, RunState::begin)
            .await?;
        let raw_key = object_key(Stage::PublishRaw, ObjectKey::raw(&ctx.pipeline, &ctx.run_id))?;
        self.attempt(ctx, Stage::PublishRaw, || {
            self.publisher.publish(&raw, &raw_key)
        })
        .await?;
        record.raw_object_key = Some(raw_key.to_string());
        self.transition(record, Stage::PublishRaw, RunState::finish)
            .await?;

        let raw = self.require(ctx, Stage::Transform, ArtifactKind::Raw).await?;
        self.transition(record, Stage::Transform, RunState::begin)
            .await?;
        let staged_transformed = self
            .staging
            .existing(ctx, ArtifactKind::Transformed)
            .await
            .map_err(|e| (Stage::Transform, e))?;
        let rows = match staged_transformed {
            Some(artifact) => {
                tracing::info!(run_id = %ctx.run_id, "reusing staged transformed snapshot");
                self.count_rows(&artifact)
                    .await
                    .map_err(|e| (Stage::Transform, e))?
            }
            None => {
                self.attempt(ctx, Stage::Transform, || {
                    self.transformer.transform(ctx, &raw)
                })
                .await?
                .rows
            }
        };
        record.record_count = Some(rows as i64);
        self.transition(record, Stage::Transform, RunState::finish)
            .await?;

        let transformed = self
            .require(ctx, Stage::PublishTransformed, ArtifactKind::Transformed)
            .await?;
        self.transition(record, Stage::PublishTransformed, RunState::begin)
            .await?;
        let transformed_key = object_key(
            Stage::PublishTransformed,
            ObjectKey::transformed(&ctx.pipeline, &ctx.run_id),
        )?;
        self.attempt(ctx, Stage::PublishTransformed, || {
            self.publisher.publish(&transformed, &transformed_key)
        })
        .await?;
        record.transformed_object_key = Some(transformed_key.to_string());
        self.transition(record, Stage::PublishTransformed, RunState::finish)
            .await?;

        record.state = record
            .state
            .complete()
            .map_err(|e| (Stage::PublishTransformed, e))?;
        record.updated_at = Utc::now();
        self.save(record).await;
        Ok(())
    }

    async fn transition(
        &self,
        record: &mut RunRecord,
        stage: Stage,
        step: fn(&RunState, Stage) -> Result<RunState, StageError>,
    ) -> Result<(), StageFailure> {
        let next = step(&record.state, stage).map_err(|e| (stage, e))?;
        if next != record.state {
            tracing::debug!(run_id = %record.run_id, from = %record.state, to = %next, "run state");
            record.state = next;
            record.updated_at = Utc::now();
            self.save(record).await;
        }
        Ok(())
    }

    /// A stage may only start once the artifact it consumes exists and is
    /// non-empty.
    async fn require(
        &self,
        ctx: &RunContext,
        stage: Stage,
        kind: ArtifactKind,
    ) -> Result<StagedArtifact, StageFailure> {
        self.staging
            .require(ctx, kind)
            .await
            .map_err(|e| (stage, e))
    }

    async fn attempt<T, F, Fut>(
        &self,
        ctx: &RunContext,
        stage: Stage,
        mut op: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        pipeline = %ctx.pipeline,
                        run_id = %ctx.run_id,
                        %stage,
                        attempt,
                        ?backoff,
                        kind = %err.kind(),
                        error = %err,
                        "stage failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err((stage, err)),
            }
        }
    }

    async fn count_rows(&self, artifact: &StagedArtifact) -> Result<usize, StageError> {
        let bytes = self.staging.read(artifact).await?;
        read_records(&bytes).map(|rows| rows.len()).map_err(|e| {
            StageError::staging(
                &artifact.path,
                io::Error::new(io::ErrorKind::InvalidData, format!("{e:#}")),
            )
        })
    }

    async fn save(&self, record: &RunRecord) {
        if let Err(err) = self.ledger.record(record).await {
            tracing::warn!(
                run_id = %record.run_id,
                state = %record.state,
                error = %err,
                "failed to record run state"
            );
        }
    }
}

fn object_key(stage: Stage, key: anyhow::Result<ObjectKey>) -> Result<ObjectKey, StageFailure> {
    key.map_err(|e| (stage, StageError::publish("<invalid key>", &e)))
}

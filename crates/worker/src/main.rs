use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use marketsnap_core::config::Settings;
use marketsnap_core::domain::run::{RunContext, RunId, RunState};
use marketsnap_core::ingest::provider::HttpSnapshotSource;
use marketsnap_core::pipeline::{MemoryRunLedger, PipelineController, RunLedger, RunRecord, Trigger};
use marketsnap_core::publish::sink_from_settings;
use marketsnap_core::staging::StagingArea;
use marketsnap_core::storage::lock::RunLock;
use marketsnap_core::storage::{self, PgRunLedger};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "marketsnap_worker")]
struct Args {
    /// Run the current tick once and exit instead of looping.
    #[arg(long)]
    once: bool,

    /// Replay (or resume) an explicit run, e.g. 20240705T121000, and exit.
    #[arg(long, conflicts_with = "once")]
    run_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let pool = match settings.database_url.as_deref() {
        Some(url) => {
            let pool = storage::connect(url).await?;
            storage::migrate(&pool).await?;
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; run ledger is in-memory and runs are not locked");
            None
        }
    };
    let ledger: Arc<dyn RunLedger> = match &pool {
        Some(pool) => Arc::new(PgRunLedger::new(pool.clone())),
        None => Arc::new(MemoryRunLedger::new()),
    };

    let staging = StagingArea::new(&settings.staging_dir);
    match staging.sweep_pipeline(&settings.pipeline_name).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed stale staging temp files"),
        Err(err) => tracing::warn!(error = %err, "staging sweep failed"),
    }

    let source = Arc::new(HttpSnapshotSource::from_settings(&settings)?);
    let sink = sink_from_settings(&settings)?;
    let controller = PipelineController::from_settings(&settings, source, sink, ledger);

    if let Some(run_id) = args.run_id.as_deref() {
        let run_id = RunId::parse(run_id).context("invalid --run-id")?;
        let ctx = RunContext::from_run_id(settings.pipeline_name.clone(), run_id);
        return run_one(&controller, pool.as_ref(), &ctx).await;
    }

    let mut trigger = Trigger::new(settings.pipeline_name.clone(), settings.run_interval);

    if args.once {
        let now = chrono::Utc::now();
        let Some(ctx) = trigger.poll(now) else {
            return Ok(());
        };
        return run_one(&controller, pool.as_ref(), &ctx).await;
    }

    tracing::info!(
        pipeline = %settings.pipeline_name,
        interval_secs = settings.run_interval.as_secs(),
        "worker started"
    );

    loop {
        if let Some(ctx) = trigger.poll(chrono::Utc::now()) {
            tokio::select! {
                res = run_one(&controller, pool.as_ref(), &ctx) => {
                    if let Err(err) = res {
                        tracing::warn!(run_id = %ctx.run_id, error = %format!("{err:#}"), "run did not complete");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!(run_id = %ctx.run_id, "interrupted during run");
                    break;
                }
            }
        }

        let wait = trigger.until_next(chrono::Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("worker stopped");
    Ok(())
}

/// Runs one context under the advisory lock (when a database is configured).
/// Returns an error if the run did not complete.
async fn run_one(
    controller: &PipelineController,
    pool: Option<&sqlx::PgPool>,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let lock = match pool {
        Some(pool) => match RunLock::try_acquire(pool, ctx).await? {
            Some(lock) => Some(lock),
            None => {
                tracing::warn!(run_id = %ctx.run_id, "run lock not acquired; another worker is running it");
                return Ok(());
            }
        },
        None => None,
    };

    let record = controller.run(ctx).await;

    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            tracing::warn!(run_id = %ctx.run_id, error = %format!("{err:#}"), "failed to release run lock");
        }
    }

    report(&record)
}

fn report(record: &RunRecord) -> anyhow::Result<()> {
    match &record.state {
        RunState::Complete => Ok(()),
        RunState::Failed { stage, kind, cause } => {
            let err = anyhow::anyhow!("{cause}").context(format!(
                "run {} of {} failed at {stage} ({kind})",
                record.run_id, record.pipeline
            ));
            sentry_anyhow::capture_anyhow(&err);
            Err(err)
        }
        other => anyhow::bail!("run {} stopped in state {other}", record.run_id),
    }
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

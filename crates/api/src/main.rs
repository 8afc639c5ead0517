use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketsnap_core::config::{is_valid_pipeline_name, Settings};
use marketsnap_core::domain::run::RunId;
use marketsnap_core::pipeline::{RunLedger, RunRecord};
use marketsnap_core::storage::{self, PgRunLedger};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

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

    let ledger: Option<Arc<dyn RunLedger>> = match settings.require_database_url() {
        Ok(db_url) => match storage::connect(db_url).await {
            Ok(pool) => match storage::migrate(&pool).await {
                Ok(()) => Some(Arc::new(PgRunLedger::new(pool))),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %e, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let app = router(AppState { ledger });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/runs/:pipeline", get(list_runs))
        .route("/runs/:pipeline/:run_id", get(get_run))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    ledger: Option<Arc<dyn RunLedger>>,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RunRecord>>, StatusCode> {
    let Some(ledger) = &state.ledger else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    if !is_valid_pipeline_name(&pipeline) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let runs = ledger.recent(&pipeline, limit).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    Path((pipeline, run_id)): Path<(String, String)>,
) -> Result<Json<RunRecord>, StatusCode> {
    let Some(ledger) = &state.ledger else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    if !is_valid_pipeline_name(&pipeline) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let run_id = RunId::parse(&run_id).map_err(|_| StatusCode::BAD_REQUEST)?;

    let run = ledger
        .get(&pipeline, &run_id)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(run))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use marketsnap_core::domain::run::{RunContext, RunState};
    use marketsnap_core::pipeline::MemoryRunLedger;

    async fn seeded(n: i64) -> AppState {
        let ledger = MemoryRunLedger::new();
        let base = Utc.with_ymd_and_hms(2024, 7, 5, 12, 0, 0).unwrap();
        for i in 0..n {
            let ctx = RunContext::new("crypto_markets", base + Duration::minutes(10 * i));
            let mut rec = RunRecord::scheduled(&ctx, Utc::now());
            rec.state = RunState::Complete;
            ledger.record(&rec).await.unwrap();
        }
        AppState {
            ledger: Some(Arc::new(ledger)),
        }
    }

    fn run(pipeline: &str, run_id: &str) -> Path<(String, String)> {
        Path((pipeline.to_string(), run_id.to_string()))
    }

    #[tokio::test]
    async fn lists_newest_first_with_bounded_limit() {
        let state = seeded(3).await;
        let Json(runs) = list_runs(
            State(state.clone()),
            Path("crypto_markets".into()),
            Query(ListParams { limit: Some(2) }),
        )
        .await
        .unwrap();

        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, ["20240705T122000", "20240705T121000"]);

        let Json(all) = list_runs(
            State(state),
            Path("crypto_markets".into()),
            Query(ListParams::default()),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn single_run_lookup() {
        let state = seeded(1).await;

        let Json(found) = get_run(State(state.clone()), run("crypto_markets", "20240705T120000"))
            .await
            .unwrap();
        assert_eq!(found.state, RunState::Complete);

        assert_eq!(
            get_run(State(state.clone()), run("crypto_markets", "20240705T121000"))
                .await
                .unwrap_err(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_run(State(state.clone()), run("crypto_markets", "yesterday"))
                .await
                .unwrap_err(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_run(State(state), run("Crypto Markets", "20240705T120000"))
                .await
                .unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn degraded_without_database() {
        let state = AppState { ledger: None };
        assert_eq!(
            get_run(State(state.clone()), run("crypto_markets", "20240705T120000"))
                .await
                .unwrap_err(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            list_runs(
                State(state),
                Path("crypto_markets".into()),
                Query(ListParams::default())
            )
            .await
            .unwrap_err(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

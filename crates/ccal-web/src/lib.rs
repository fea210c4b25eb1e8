//! Axum read API over the stored contest snapshots.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ccal_core::{ContestKind, ContestRecord};
use ccal_storage::ContestSink;
use ccal_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ccal-web";

pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn ContestSink>,
    /// Backs `/update`; absent in read-only deployments.
    pub pipeline: Option<Arc<SyncPipeline>>,
}

impl AppState {
    pub fn new(sink: Arc<dyn ContestSink>) -> Self {
        Self {
            sink,
            pipeline: None,
        }
    }

    pub fn with_pipeline(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            sink: pipeline.sink(),
            pipeline: Some(pipeline),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/contests/{kind}", get(contests_handler))
        .route("/json", get(upcoming_json_handler))
        .route("/update", get(update_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("CCAL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

/// Serves the API, running scheduled syncs in the background when enabled.
pub async fn serve(config: SyncConfig, port: u16) -> anyhow::Result<()> {
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %pipeline.config().sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving contest api");
    axum::serve(listener, app(AppState::with_pipeline(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env(), web_port_from_env()).await
}

async fn contests_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
) -> Response {
    match kind.parse::<ContestKind>() {
        Ok(kind) => latest_contests(&state, kind).await,
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

async fn upcoming_json_handler(State(state): State<Arc<AppState>>) -> Response {
    latest_contests(&state, ContestKind::Upcoming).await
}

async fn update_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "sync is not configured for this server".to_string(),
        );
    };
    match pipeline.run_once(ContestKind::Upcoming).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            error!(error = %err, "on-demand sync failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn latest_contests(state: &AppState, kind: ContestKind) -> Response {
    match state.sink.load(kind).await {
        Ok(snapshot) => {
            let contests: Vec<ContestRecord> =
                snapshot.map(|s| s.contests).unwrap_or_default();
            Json(contests).into_response()
        }
        Err(err) => {
            error!(%kind, error = %err, "loading snapshot failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

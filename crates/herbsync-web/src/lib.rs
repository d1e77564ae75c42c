//! Axum JSON API for operators: import checkpoints, resets and recent runs.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use herbsync_core::{ImportCheckpoint, ImportRunLog, ImportState};
use herbsync_storage::{CheckpointStore, RunLogStore};
use herbsync_sync::{reset_checkpoint, ImportError, ImportPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "herbsync-web";

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub runs: Arc<dyn RunLogStore>,
    /// Registered provider ids, in registry order.
    pub providers: Vec<String>,
    pub lease_ttl: Duration,
}

impl AppState {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        runs: Arc<dyn RunLogStore>,
        providers: Vec<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            checkpoints,
            runs,
            providers,
            lease_ttl,
        }
    }

    pub fn from_pipeline(pipeline: &ImportPipeline) -> Self {
        let stores = pipeline.stores();
        Self::new(
            stores.checkpoints.clone(),
            stores.run_log.clone(),
            pipeline
                .registry()
                .providers
                .iter()
                .map(|p| p.provider_id.clone())
                .collect(),
            pipeline.config().lease_ttl(),
        )
    }

    fn knows(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointView {
    #[serde(flatten)]
    pub checkpoint: ImportCheckpoint,
    pub lifecycle: ImportState,
}

impl From<ImportCheckpoint> for CheckpointView {
    fn from(checkpoint: ImportCheckpoint) -> Self {
        Self {
            lifecycle: checkpoint.state(),
            checkpoint,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/checkpoints", get(checkpoints_handler))
        .route("/checkpoints/{provider}", get(checkpoint_handler))
        .route("/checkpoints/{provider}/reset", post(reset_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving operator api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn checkpoints_handler(State(state): State<Arc<AppState>>) -> Response {
    let stored = match state.checkpoints.list_checkpoints().await {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };
    // Registered providers without a row yet show up as not started.
    let views: Vec<CheckpointView> = state
        .providers
        .iter()
        .map(|provider| {
            stored
                .iter()
                .find(|c| &c.provider == provider)
                .cloned()
                .unwrap_or_else(|| ImportCheckpoint::new(provider.as_str()))
                .into()
        })
        .collect();
    Json(views).into_response()
}

async fn checkpoint_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Response {
    if !state.knows(&provider) {
        return not_found(&provider);
    }
    match state.checkpoints.load_checkpoint(&provider).await {
        Ok(checkpoint) => Json(CheckpointView::from(checkpoint)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Response {
    if !state.knows(&provider) {
        return not_found(&provider);
    }
    match reset_checkpoint(state.checkpoints.as_ref(), &provider, state.lease_ttl).await {
        Ok(checkpoint) => Json(CheckpointView::from(checkpoint)).into_response(),
        Err(err @ ImportError::Busy { .. }) => json_error(StatusCode::CONFLICT, err.to_string()),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    match state.runs.recent_run_logs(limit).await {
        Ok(runs) => Json::<Vec<ImportRunLog>>(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(provider: &str) -> Response {
    json_error(StatusCode::NOT_FOUND, format!("unknown provider {provider}"))
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "operator api request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

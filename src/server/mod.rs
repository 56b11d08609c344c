//! Reference artifact server
//!
//! Serves a producer data root over the endpoints the HTTP artifact source
//! consumes. Only published files are served; generating them is the
//! producer's job.

mod data_root;

pub use data_root::DataRoot;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::SyncError;
use crate::sync::{resolve_strategy, LocalVersion, PlanReason};
use crate::types::{normalize_dataset, Strategy, SyncPolicy};

/// Error body returned by every endpoint
struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn dataset_param(dataset: &str) -> std::result::Result<String, ApiError> {
    normalize_dataset(dataset).map_err(|e| ApiError(SyncError::InvalidInput(e.to_string())))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    current: Option<String>,
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatchQuery {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    version: String,
}

/// What a client at `currentVersion` would do next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub dataset: String,
    pub latest_version: String,
    pub latest_hash: String,
    pub current_version: Option<String>,
    pub needs_sync: bool,
    pub strategy_hint: Strategy,
    pub reason: PlanReason,
    pub missed_count: Option<u32>,
    pub sync_policy: SyncPolicy,
}

/// Build the router over a data root
pub fn router(root: Arc<DataRoot>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/datasets/:dataset/manifest", get(manifest_handler))
        .route("/datasets/:dataset/status", get(status_handler))
        .route("/datasets/:dataset/patch", get(patch_handler))
        .route("/datasets/:dataset/snapshot", get(snapshot_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(root)
}

/// Serve a data root on an already-bound listener
pub async fn serve(listener: tokio::net::TcpListener, root: Arc<DataRoot>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, root = %root.root().display(), "Artifact server listening");
    }
    axum::serve(listener, router(root)).await
}

/// Bind `addr` and serve a data root until the process exits
pub async fn start(addr: SocketAddr, root: Arc<DataRoot>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, root).await
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn manifest_handler(
    State(root): State<Arc<DataRoot>>,
    Path(dataset): Path<String>,
) -> ApiResult<crate::types::Manifest> {
    let dataset = dataset_param(&dataset)?;
    let manifest = root.manifest(&dataset).await?;
    Ok(Json(manifest.as_ref().clone()))
}

async fn status_handler(
    State(root): State<Arc<DataRoot>>,
    Path(dataset): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<StatusResponse> {
    let dataset = dataset_param(&dataset)?;
    let manifest = root.manifest(&dataset).await?;

    // Without a client hash, assume the client matches what was published
    let hash = query.hash.clone().or_else(|| {
        query
            .current
            .as_deref()
            .and_then(|v| manifest.hash_for(v))
            .map(String::from)
    });
    let local = LocalVersion {
        version: query.current.clone(),
        state_hash: hash,
    };
    let plan = resolve_strategy(&local, &manifest, false);

    Ok(Json(StatusResponse {
        dataset,
        latest_version: manifest.latest_version.clone(),
        latest_hash: manifest.latest_hash.clone(),
        current_version: query.current,
        needs_sync: !plan.is_noop(),
        strategy_hint: plan.strategy,
        reason: plan.reason,
        missed_count: plan.missed,
        sync_policy: manifest.sync_policy.clone(),
    }))
}

async fn patch_handler(
    State(root): State<Arc<DataRoot>>,
    Path(dataset): Path<String>,
    Query(query): Query<PatchQuery>,
) -> ApiResult<crate::types::PatchPayload> {
    let dataset = dataset_param(&dataset)?;
    let patch = root.patch(&dataset, &query.from, &query.to).await?;
    Ok(Json(patch))
}

async fn snapshot_handler(
    State(root): State<Arc<DataRoot>>,
    Path(dataset): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<crate::types::SnapshotPayload> {
    let dataset = dataset_param(&dataset)?;
    let snapshot = root.snapshot(&dataset, &query.version).await?;
    Ok(Json(snapshot))
}

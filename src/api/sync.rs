use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::error_response;
use crate::models::{StoreStatus, SyncRequest, SyncSummary};
use crate::state::AppState;
use crate::sync::SyncOptions;

/// POST /api/sync - Pull the starred list and bring the store up to date
pub async fn sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncSummary>, (StatusCode, String)> {
    // The body is optional; an empty POST is a plain incremental sync.
    let req: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid sync request: {e}")))?
    };
    let summary = state
        .sync
        .sync(SyncOptions { force: req.force })
        .await
        .map_err(error_response)?;
    Ok(Json(summary))
}

/// GET /api/status - Record counts, pending embeddings and last sync time
pub async fn status(
    State(state): State<AppState>,
) -> Result<Json<StoreStatus>, (StatusCode, String)> {
    state
        .store
        .blocking(|store| store.status())
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/rebuild - Drop all embeddings and re-embed everything
pub async fn rebuild(
    State(state): State<AppState>,
) -> Result<Json<SyncSummary>, (StatusCode, String)> {
    let summary = state.sync.rebuild().await.map_err(error_response)?;
    Ok(Json(summary))
}

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::error_response;
use crate::models::{SearchRequest, SearchResponse};
use crate::state::AppState;

/// POST /api/search - Semantic, keyword or hybrid (RRF) search over stars
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let results = state
        .search
        .search(&req.query, req.mode, req.limit)
        .await
        .map_err(error_response)?;

    tracing::info!(
        "Search {:?} ({:?}): {} results",
        req.query,
        req.mode,
        results.len()
    );

    Ok(Json(SearchResponse {
        query: req.query,
        mode: req.mode,
        results,
    }))
}

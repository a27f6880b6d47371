use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error_response;
use crate::models::{RepoMetadata, Repository};
use crate::state::AppState;

/// A stored repository without its embedding vector.
#[derive(Debug, Serialize)]
pub struct RepoView {
    pub id: String,
    pub metadata: RepoMetadata,
    pub content_digest: String,
    pub pending: bool,
    pub pending_reason: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

impl From<Repository> for RepoView {
    fn from(repo: Repository) -> Self {
        Self {
            pending: repo.is_pending(),
            id: repo.id,
            metadata: repo.metadata,
            content_digest: repo.content_digest,
            pending_reason: repo.pending_reason,
            last_synced_at: repo.last_synced_at,
        }
    }
}

/// GET /api/repos - List all stored repositories in id order
pub async fn list_repos(
    State(state): State<AppState>,
) -> Result<Json<Vec<RepoView>>, (StatusCode, String)> {
    let repos = state
        .store
        .blocking(|store| store.list_all())
        .await
        .map_err(error_response)?;
    Ok(Json(repos.into_iter().map(RepoView::from).collect()))
}

/// GET /api/repos/{owner}/{name} - Fetch a single repository
pub async fn get_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<RepoView>, (StatusCode, String)> {
    let id = format!("{owner}/{name}");
    let lookup = id.clone();
    let found = state
        .store
        .blocking(move |store| store.get(&lookup))
        .await
        .map_err(error_response)?;
    match found {
        Some(repo) => Ok(Json(repo.into())),
        None => Err((StatusCode::NOT_FOUND, format!("Repository {id} not found"))),
    }
}

/// GET /api/config - Embedding configuration (API key redacted)
pub async fn get_config(State(state): State<AppState>) -> Json<LlmConfigResponse> {
    let config = &state.config.llm;
    Json(LlmConfigResponse {
        provider: config.provider.clone(),
        base_url: config.base_url.clone(),
        embedding_model: config.embedding_model.clone(),
        embedding_dim: config.embedding_dim,
        has_api_key: config.api_key.is_some(),
        store_dimension: state.store.dimension(),
    })
}

/// Config response with API key redacted
#[derive(Serialize)]
pub struct LlmConfigResponse {
    pub provider: String,
    pub base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub has_api_key: bool,
    /// Dimension the vector index is locked to, if any
    pub store_dimension: Option<usize>,
}

use axum::routing::{get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use star_search::api;
use star_search::config::Config;
use star_search::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!(
        "Embedding provider: {} ({}, model {})",
        config.llm.provider,
        config.llm.base_url,
        config.llm.embedding_model
    );
    if config.github.token.is_none() {
        tracing::warn!("GITHUB_TOKEN is not set; syncing will fail to list stars");
    }

    let state = AppState::new(config.clone())?;

    let app = Router::new()
        .route("/api/sync", post(api::sync::sync))
        .route("/api/rebuild", post(api::sync::rebuild))
        .route("/api/status", get(api::sync::status))
        .route("/api/search", post(api::search::search))
        .route("/api/repos", get(api::repos::list_repos))
        .route("/api/repos/{owner}/{name}", get(api::repos::get_repo))
        .route("/api/config", get(api::repos::get_config))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

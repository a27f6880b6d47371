use std::sync::Arc;

use crate::config::Config;
use crate::llm::{EmbeddingProvider, HttpEmbedder};
use crate::search::engine::SearchEngine;
use crate::source::{GithubStarSource, SourceProvider};
use crate::store::Store;
use crate::sync::SyncEngine;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub sync: Arc<SyncEngine>,
    pub search: Arc<SearchEngine>,
}

impl AppState {
    /// Open the store and wire the GitHub source and HTTP embedder.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let source: Arc<dyn SourceProvider> =
            Arc::new(GithubStarSource::new(config.github.clone()));
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HttpEmbedder::new(config.llm.clone()));
        Self::with_providers(config, source, embedder)
    }

    pub fn with_providers(
        config: Config,
        source: Arc<dyn SourceProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Self> {
        let dim = (config.llm.embedding_dim > 0).then_some(config.llm.embedding_dim);
        let store = Arc::new(Store::open(&config.data_dir, dim)?);

        let recovery = store.last_recovery();
        if !recovery.is_clean() {
            tracing::info!("Repaired {} store inconsistencies at startup", recovery.total());
        }

        let sync = SyncEngine::new(
            store.clone(),
            source,
            embedder.clone(),
            config.sync.clone(),
        );
        let search = SearchEngine::new(store.clone(), embedder, config.search.clone());

        Ok(Self {
            config,
            store,
            sync: Arc::new(sync),
            search: Arc::new(search),
        })
    }
}

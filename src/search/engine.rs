use std::sync::Arc;

use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::llm::{embed_with_timeout, EmbeddingProvider};
use crate::models::{MatchType, SearchHit, SearchMode};
use crate::search::bm25::tokenize;
use crate::search::hybrid::{rrf_fusion, FusedHit};
use crate::store::Store;

/// Executes semantic, keyword and hybrid queries against the store.
pub struct SearchEngine {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Run `query` in `mode` and return at most `limit` hits, best first.
    ///
    /// Invalid input is rejected with [`Error::InvalidQuery`] before any
    /// index is consulted. Identical calls against an unchanged store return
    /// identical results.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidQuery("query is empty".to_string()));
        }
        if limit == 0 {
            return Err(Error::InvalidQuery("limit must be at least 1".to_string()));
        }
        if limit > self.config.max_limit {
            return Err(Error::InvalidQuery(format!(
                "limit {limit} exceeds the maximum of {}",
                self.config.max_limit
            )));
        }
        let terms = tokenize(query);
        if mode == SearchMode::Keyword && terms.is_empty() {
            return Err(Error::InvalidQuery(
                "query has no searchable words".to_string(),
            ));
        }

        self.store.ensure_current_model()?;

        let width = match mode {
            SearchMode::Hybrid => self.config.candidate_width.max(limit),
            _ => limit,
        };
        let query_vector = match mode {
            SearchMode::Semantic | SearchMode::Hybrid => Some(
                embed_with_timeout(self.embedder.as_ref(), query, self.config.embed_timeout)
                    .await?,
            ),
            SearchMode::Keyword => None,
        };

        let rrf_k = self.config.rrf_k;
        let query = query.to_string();
        self.store
            .blocking(move |store| {
                let semantic = match &query_vector {
                    Some(vector) => store.vectors().query(vector, width)?,
                    None => Vec::new(),
                };
                let keyword = match mode {
                    SearchMode::Keyword | SearchMode::Hybrid => store.text().query(&terms, width)?,
                    SearchMode::Semantic => Vec::new(),
                };
                if mode == SearchMode::Hybrid {
                    tracing::debug!(
                        "Hybrid candidates for {query:?}: {} semantic, {} keyword",
                        semantic.len(),
                        keyword.len()
                    );
                }

                let mut hits = Vec::new();
                for hit in rrf_fusion(&semantic, &keyword, rrf_k, limit) {
                    if let Some(hit) = hydrate(store, hit, mode)? {
                        hits.push(hit);
                    }
                }
                Ok(hits)
            })
            .await
    }
}

/// Attach stored metadata to a ranked id. Single-ranker modes report that
/// ranker's raw score; hybrid reports the fused score.
///
/// A hit whose record is tombstoned belongs to a delete in progress and is
/// dropped. A hit with no record at all is corruption.
fn hydrate(store: &Store, hit: FusedHit, mode: SearchMode) -> Result<Option<SearchHit>> {
    let repo = store.record(&hit.id)?.ok_or_else(|| {
        Error::IndexCorruption(format!("index entry {} has no repository record", hit.id))
    })?;
    if repo.tombstoned {
        return Ok(None);
    }

    let (score, match_type) = match mode {
        SearchMode::Semantic => (
            hit.semantic_score.map(f64::from).unwrap_or_default(),
            MatchType::Semantic,
        ),
        SearchMode::Keyword => (
            hit.keyword_score.map(f64::from).unwrap_or_default(),
            MatchType::Keyword,
        ),
        SearchMode::Hybrid => (hit.score, hit.match_type()),
    };

    Ok(Some(SearchHit {
        id: hit.id,
        score,
        metadata: repo.metadata,
        match_type,
        semantic_rank: hit.semantic_rank,
        semantic_score: hit.semantic_score,
        keyword_rank: hit.keyword_rank,
        keyword_score: hit.keyword_score,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RepoMetadata, Repository};
    use crate::search::bm25::normalize_text;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Maps the query onto two axes: "rust" and "python".
    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let tokens = tokenize(text);
            let rust = tokens.iter().filter(|t| *t == "rust").count() as f32;
            let python = tokens.iter().filter(|t| *t == "python").count() as f32;
            Ok(vec![rust + 0.01, python + 0.01])
        }

        fn model(&self) -> &str {
            "axis"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("model offline")
        }

        fn model(&self) -> &str {
            "offline"
        }
    }

    fn record(id: &str, embedding: Vec<f32>, text: &str) -> Repository {
        Repository {
            id: id.to_string(),
            metadata: RepoMetadata {
                html_url: format!("https://github.com/{id}"),
                description: Some(text.to_string()),
                ..Default::default()
            },
            content_digest: id.to_string(),
            embedding: Some(embedding),
            indexed_text: normalize_text(text),
            last_synced_at: Utc::now(),
            pending_reason: None,
            tombstoned: false,
        }
    }

    fn engine(dir: &tempfile::TempDir, embedder: Arc<dyn EmbeddingProvider>) -> SearchEngine {
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        store
            .upsert(&record("pyo3/pyo3", vec![1.0, 1.0], "rust bindings for python"))
            .unwrap();
        store
            .upsert(&record("rust-lang/rust", vec![1.0, 0.0], "the rust compiler"))
            .unwrap();
        store
            .upsert(&record("django/django", vec![0.0, 1.0], "python web framework"))
            .unwrap();
        SearchEngine::new(store, embedder, SearchConfig::default())
    }

    #[tokio::test]
    async fn test_rejects_invalid_queries() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(AxisEmbedder));

        for (query, mode, limit) in [
            ("", SearchMode::Hybrid, 10),
            ("   ", SearchMode::Semantic, 10),
            ("rust", SearchMode::Keyword, 0),
            ("rust", SearchMode::Keyword, 1000),
            ("?!", SearchMode::Keyword, 10),
        ] {
            let err = engine.search(query, mode, limit).await.unwrap_err();
            assert!(matches!(err, Error::InvalidQuery(_)), "{query:?} {mode:?} {limit}");
        }
    }

    #[tokio::test]
    async fn test_semantic_ranks_by_cosine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(AxisEmbedder));

        let hits = engine.search("rust", SearchMode::Semantic, 10).await.unwrap();
        assert_eq!(hits[0].id, "rust-lang/rust");
        assert_eq!(hits[0].match_type, MatchType::Semantic);
        assert_eq!(hits[0].semantic_rank, Some(1));
        assert!(hits[0].score <= 1.0);
    }

    #[tokio::test]
    async fn test_keyword_matches_text() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(AxisEmbedder));

        let hits = engine.search("framework", SearchMode::Keyword, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "django/django");
        assert_eq!(hits[0].match_type, MatchType::Keyword);
        assert!(hits[0].keyword_score.is_some());
    }

    #[tokio::test]
    async fn test_hybrid_rewards_agreement() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(AxisEmbedder));

        let hits = engine
            .search("rust python bindings", SearchMode::Hybrid, 10)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "pyo3/pyo3");
        assert_eq!(hits[0].match_type, MatchType::Hybrid);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_repeated_search_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(AxisEmbedder));

        let first = engine.search("rust", SearchMode::Hybrid, 10).await.unwrap();
        let second = engine.search("rust", SearchMode::Hybrid, 10).await.unwrap();
        let ids = |hits: &[SearchHit]| hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_hybrid_does_not_hide_embedding_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, Arc::new(FailingEmbedder));

        let err = engine.search("rust", SearchMode::Hybrid, 10).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(_)));

        // Keyword mode never calls the embedder.
        assert!(engine.search("rust", SearchMode::Keyword, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_search_skips_records_being_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        store
            .upsert(&record("a/b", vec![1.0, 0.0], "rust graph database"))
            .unwrap();
        store
            .upsert(&record("c/d", vec![0.9, 0.1], "rust graph layout"))
            .unwrap();
        // First step of a delete: the record is tombstoned, entries remain.
        store.records().mark_tombstoned("a/b").unwrap();

        let engine = SearchEngine::new(store, Arc::new(AxisEmbedder), SearchConfig::default());
        for mode in [SearchMode::Hybrid, SearchMode::Semantic, SearchMode::Keyword] {
            let hits = engine.search("rust graph", mode, 10).await.unwrap();
            let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
            assert_eq!(ids, vec!["c/d"], "{mode:?}");
        }
    }

    #[tokio::test]
    async fn test_hit_without_record_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        store.text().put("ghost/repo", "rust").unwrap();

        let engine = SearchEngine::new(store, Arc::new(AxisEmbedder), SearchConfig::default());
        let err = engine.search("rust", SearchMode::Keyword, 10).await.unwrap_err();
        assert!(matches!(err, Error::IndexCorruption(_)));
    }

    #[tokio::test]
    async fn test_search_refused_until_rebuild_after_model_change() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(3)).unwrap();
            store
                .upsert(&record("a/b", vec![1.0, 0.0, 0.0], "rust graph"))
                .unwrap();
        }
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        let engine =
            SearchEngine::new(store.clone(), Arc::new(AxisEmbedder), SearchConfig::default());

        let err = engine.search("rust", SearchMode::Keyword, 10).await.unwrap_err();
        assert!(matches!(err, Error::IndexCorruption(_)));

        {
            let _guard = store.try_begin_sync().unwrap();
            store.reset_embeddings().unwrap();
        }
        store
            .upsert(&record("a/b", vec![1.0, 0.0], "rust graph"))
            .unwrap();
        let hits = engine.search("rust", SearchMode::Hybrid, 10).await.unwrap();
        assert_eq!(hits[0].id, "a/b");
    }

    #[tokio::test]
    async fn test_empty_store_returns_no_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        let engine = SearchEngine::new(store, Arc::new(AxisEmbedder), SearchConfig::default());

        assert!(engine.search("rust", SearchMode::Hybrid, 5).await.unwrap().is_empty());
        assert!(engine.search("rust", SearchMode::Keyword, 5).await.unwrap().is_empty());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Descriptive fields of a starred repository. Replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    /// Numeric GitHub id, when the source provides one
    pub github_id: Option<u64>,
    pub html_url: String,
    pub homepage: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Primary language
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    pub starred_at: Option<DateTime<Utc>>,
    pub updated_at: Option<String>,
}

/// One entry of a source snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRepo {
    /// `owner/name`
    pub id: String,
    pub metadata: RepoMetadata,
}

impl SourceRepo {
    /// The text that is embedded and keyword-indexed for this repository.
    ///
    /// Format: `"owner/name: description"` followed by a `Topics:` line when
    /// the repository has topics.
    pub fn search_text(&self) -> String {
        let mut text = self.id.clone();
        if let Some(desc) = self.metadata.description.as_deref() {
            let desc = desc.trim();
            if !desc.is_empty() {
                text.push_str(": ");
                text.push_str(desc);
            }
        }
        if !self.metadata.topics.is_empty() {
            text.push_str("\nTopics: ");
            text.push_str(&self.metadata.topics.join(", "));
        }
        text
    }
}

/// A stored repository record. The `id` is the join key for both indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub metadata: RepoMetadata,
    /// SHA-256 of the search text the embedding and text entry were built from
    pub content_digest: String,
    /// `None` while the record is pending embedding
    pub embedding: Option<Vec<f32>>,
    /// Normalized token stream fed to the text index
    pub indexed_text: String,
    pub last_synced_at: DateTime<Utc>,
    /// Why the last embedding attempt failed, if it did
    #[serde(default)]
    pub pending_reason: Option<String>,
    /// Set while a cascading delete is in progress
    #[serde(default)]
    pub tombstoned: bool,
}

impl Repository {
    pub fn is_pending(&self) -> bool {
        self.embedding.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

/// Which ranker(s) produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Semantic,
    Keyword,
    Hybrid,
}

/// A ranked search result with enough detail to explain its position.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Cosine similarity, BM25 relevance, or fused RRF score depending on mode
    pub score: f64,
    pub metadata: RepoMetadata,
    pub match_type: MatchType,
    /// 1-based rank in the semantic ranker, if it returned this id
    pub semantic_rank: Option<usize>,
    pub semantic_score: Option<f32>,
    /// 1-based rank in the keyword ranker, if it returned this id
    pub keyword_rank: Option<usize>,
    pub keyword_score: Option<f32>,
}

/// A repository that could not be embedded during a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    /// Digest unchanged, nothing written besides the sync timestamp
    pub unchanged: usize,
    /// Digest unchanged but metadata replaced, embedding kept
    pub refreshed: usize,
    pub failures: Vec<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            added: 0,
            updated: 0,
            removed: 0,
            failed: 0,
            unchanged: 0,
            refreshed: 0,
            failures: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    pub fn record_failure(&mut self, id: &str, reason: impl Into<String>) {
        self.failed += 1;
        self.failures.push(SyncFailure {
            id: id.to_string(),
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub total_repositories: usize,
    pub pending_embeddings: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Locked vector dimension, if any
    pub dimension: Option<usize>,
    pub vector_entries: usize,
    pub text_entries: usize,
    /// Set when the configured model no longer matches the stored vectors
    pub rebuild_required: Option<String>,
}

/// Search request
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Search response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchHit>,
}

/// Sync request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub force: bool,
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the record store and text index live
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Embedding provider configuration
    pub llm: LlmConfig,
    /// Starred-repository source configuration
    pub github: GithubConfig,
    pub sync: SyncConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the embedding API
    pub base_url: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Embedding vector dimension. The store is locked to this value.
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub api_url: String,
    /// Personal access token used to list the user's stars
    pub token: Option<String>,
    pub per_page: usize,
}

/// Tuning for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Per-call timeout for the embedding provider
    pub embed_timeout: Duration,
    /// Maximum embedding calls in flight during a sync
    pub embed_concurrency: usize,
}

/// Tuning for the search engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// RRF damping constant
    pub rrf_k: f64,
    /// Candidates pulled from each ranker in hybrid mode (at least the limit)
    pub candidate_width: usize,
    /// Largest result limit a caller may request
    pub max_limit: usize,
    /// Query embedding timeout
    pub embed_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8000".to_string(),
            llm: LlmConfig::default(),
            github: GithubConfig::default(),
            sync: SyncConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
            per_page: 100,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            embed_timeout: Duration::from_secs(30),
            embed_concurrency: 4,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_width: 50,
            max_limit: 100,
            embed_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("STAR_SEARCH_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("STAR_SEARCH_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(dim) = std::env::var("LLM_EMBEDDING_DIM") {
            if let Ok(d) = dim.parse() {
                config.llm.embedding_dim = d;
            }
        }
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            config.github.api_url = url;
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            config.github.token = Some(token);
        }
        if let Ok(val) = std::env::var("STAR_SEARCH_EMBED_TIMEOUT_SECS") {
            if let Ok(v) = val.parse::<u64>() {
                config.sync.embed_timeout = Duration::from_secs(v);
                config.search.embed_timeout = Duration::from_secs(v);
            }
        }
        if let Ok(val) = std::env::var("STAR_SEARCH_EMBED_CONCURRENCY") {
            if let Ok(v) = val.parse::<usize>() {
                config.sync.embed_concurrency = v.max(1);
            }
        }
        if let Ok(val) = std::env::var("STAR_SEARCH_RRF_K") {
            if let Ok(v) = val.parse::<f64>() {
                if v > 0.0 {
                    config.search.rrf_k = v;
                }
            }
        }
        if let Ok(val) = std::env::var("STAR_SEARCH_CANDIDATE_WIDTH") {
            if let Ok(v) = val.parse() {
                config.search.candidate_width = v;
            }
        }
        if let Ok(val) = std::env::var("STAR_SEARCH_MAX_LIMIT") {
            if let Ok(v) = val.parse() {
                config.search.max_limit = v;
            }
        }

        config
    }
}

//! Error taxonomy shared by the store, sync and search engines.

use thiserror::Error;

/// Failures surfaced to callers of the core engine.
///
/// Per-repository embedding failures during a sync never reach this type as
/// an `Err`; they are collected into [`crate::models::SyncSummary::failures`].
#[derive(Debug, Error)]
pub enum Error {
    /// The source snapshot could not be fetched. The store was not touched.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// The embedding provider failed or timed out.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),
    /// Rejected before any index was consulted.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// Orphaned index entries, dimension mismatch, or other store damage.
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("a sync is already running against this store")]
    ConcurrentSyncRejected,
    /// redb, tantivy, serialization and IO failures.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short machine-readable name, used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceUnavailable(_) => "source_unavailable",
            Error::EmbeddingFailure(_) => "embedding_failure",
            Error::InvalidQuery(_) => "invalid_query",
            Error::IndexCorruption(_) => "index_corruption",
            Error::ConcurrentSyncRejected => "concurrent_sync_rejected",
            Error::Storage(_) => "storage",
        }
    }
}

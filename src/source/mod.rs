pub mod github;

use async_trait::async_trait;

use crate::models::SourceRepo;

pub use github::GithubStarSource;

/// Supplies the authoritative list of starred repositories.
///
/// A failure means the whole snapshot is unavailable; partial snapshots are
/// never returned, since missing entries would be read as removals.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Vec<SourceRepo>>;
}

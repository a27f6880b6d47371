//! Incremental synchronization of the store against a source snapshot.
//!
//! Embeddings are the expensive step, so a repository is only embedded when
//! it is new, its search text changed, its last attempt failed, or the
//! caller forces it.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::llm::{embed_with_timeout, EmbeddingProvider};
use crate::models::{Repository, SourceRepo, SyncSummary};
use crate::search::bm25::normalize_text;
use crate::source::SourceProvider;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-embed every repository in the snapshot regardless of its digest
    pub force: bool,
}

/// Lowercase hex SHA-256 of the text a repository is embedded from.
pub fn content_digest(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Added,
    Updated,
}

/// A repository that needs a fresh embedding.
struct EmbedJob {
    kind: JobKind,
    source: SourceRepo,
    text: String,
    digest: String,
    /// Stored record being replaced, if any
    previous: Option<Repository>,
}

pub struct SyncEngine {
    store: Arc<Store>,
    source: Arc<dyn SourceProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        source: Arc<dyn SourceProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            source,
            embedder,
            config,
        }
    }

    /// Bring the store in line with the current source snapshot.
    ///
    /// Fails with [`Error::SourceUnavailable`] before touching the store if
    /// the snapshot cannot be fetched, and with
    /// [`Error::ConcurrentSyncRejected`] if another sync holds the store.
    /// Individual embedding failures are reported in the summary; the
    /// affected repositories are stored as pending and retried next time.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncSummary> {
        let _guard = self.store.try_begin_sync()?;
        self.store.ensure_current_model()?;
        let summary = SyncSummary::new(Utc::now());

        let snapshot = self.fetch_snapshot().await?;
        self.apply(snapshot, options, summary).await
    }

    /// Drop every embedding and re-embed the whole snapshot, relocking the
    /// vector index to the configured model.
    ///
    /// The snapshot is fetched before anything is reset, so an unreachable
    /// source leaves the store as it was. The sync guard is held from the
    /// fetch to the last write.
    pub async fn rebuild(&self) -> Result<SyncSummary> {
        let _guard = self.store.try_begin_sync()?;
        let summary = SyncSummary::new(Utc::now());

        let snapshot = self.fetch_snapshot().await?;
        let reset = self
            .store
            .blocking(|store| store.reset_embeddings())
            .await?;
        tracing::info!("Rebuild: {reset} repositories queued for re-embedding");

        self.apply(snapshot, SyncOptions { force: true }, summary)
            .await
    }

    async fn fetch_snapshot(&self) -> Result<Vec<SourceRepo>> {
        self.source
            .snapshot()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("{e:#}")))
    }

    /// Diff `snapshot` against the store and write the changes. The caller
    /// holds the sync guard.
    async fn apply(
        &self,
        snapshot: Vec<SourceRepo>,
        options: SyncOptions,
        mut summary: SyncSummary,
    ) -> Result<SyncSummary> {
        let snapshot = dedup_snapshot(snapshot, &mut summary);
        let snapshot_ids: Vec<String> = snapshot.iter().map(|r| r.id.clone()).collect();

        tracing::info!(
            "Sync started: {} repositories in snapshot (force={})",
            snapshot.len(),
            options.force
        );

        let existing: BTreeMap<String, Repository> = self
            .store
            .blocking(|store| store.list_all())
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let live: HashSet<&str> = snapshot_ids.iter().map(String::as_str).collect();
        let removed: Vec<String> = existing
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        if !removed.is_empty() {
            summary.removed += self
                .store
                .blocking(move |store| {
                    for id in &removed {
                        store.delete(id)?;
                        tracing::debug!("Removed {id}, no longer starred");
                    }
                    Ok(removed.len())
                })
                .await?;
        }

        let mut jobs = Vec::new();
        let mut refreshed = Vec::new();
        for source in snapshot {
            let text = source.search_text();
            let digest = content_digest(&text);

            let Some(current) = existing.get(&source.id) else {
                jobs.push(EmbedJob {
                    kind: JobKind::Added,
                    source,
                    text,
                    digest,
                    previous: None,
                });
                continue;
            };

            if options.force || current.is_pending() || current.content_digest != digest {
                jobs.push(EmbedJob {
                    kind: JobKind::Updated,
                    source,
                    text,
                    digest,
                    previous: Some(current.clone()),
                });
            } else if current.metadata != source.metadata {
                // Same digest, so the indexed text and embedding still hold.
                refreshed.push(Repository {
                    metadata: source.metadata,
                    ..current.clone()
                });
            } else {
                tracing::debug!("Skipping {}, unchanged", source.id);
                summary.unchanged += 1;
            }
        }

        if !refreshed.is_empty() {
            summary.refreshed += self
                .store
                .blocking(move |store| {
                    for repo in &refreshed {
                        store.put_record(repo)?;
                    }
                    Ok(refreshed.len())
                })
                .await?;
        }

        self.embed_jobs(jobs, &mut summary).await?;

        let synced_at = Utc::now();
        self.store
            .blocking(move |store| {
                store.mark_synced(&snapshot_ids, synced_at)?;
                store.set_last_sync_at(synced_at)
            })
            .await?;
        summary.finished_at = synced_at;

        tracing::info!(
            "Sync complete: {} added, {} updated, {} refreshed, {} unchanged, {} removed, {} failed",
            summary.added,
            summary.updated,
            summary.refreshed,
            summary.unchanged,
            summary.removed,
            summary.failed,
        );
        Ok(summary)
    }

    /// Run embedding calls with bounded concurrency, writing each result as
    /// it arrives so an interrupted sync keeps the work already done.
    async fn embed_jobs(&self, jobs: Vec<EmbedJob>, summary: &mut SyncSummary) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        tracing::info!("Embedding {} repositories with {}", jobs.len(), self.embedder.model());

        let timeout = self.config.embed_timeout;
        let concurrency = self.config.embed_concurrency.max(1);
        let mut results = stream::iter(jobs)
            .map(|job| {
                let embedder = self.embedder.clone();
                async move {
                    let outcome = embed_with_timeout(embedder.as_ref(), &job.text, timeout).await;
                    (job, outcome)
                }
            })
            .buffer_unordered(concurrency);

        while let Some((job, outcome)) = results.next().await {
            let now = Utc::now();
            match outcome {
                Ok(vector) => {
                    let record = Repository {
                        id: job.source.id.clone(),
                        metadata: job.source.metadata,
                        content_digest: job.digest,
                        embedding: Some(vector),
                        indexed_text: normalize_text(&job.text),
                        last_synced_at: now,
                        pending_reason: None,
                        tombstoned: false,
                    };
                    self.store.blocking(move |store| store.upsert(&record)).await?;
                    match job.kind {
                        JobKind::Added => summary.added += 1,
                        JobKind::Updated => summary.updated += 1,
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!("Failed to embed {}: {reason}", job.source.id);
                    let record = match job.previous {
                        // Same text as the stored embedding: keep it, only
                        // the metadata moves forward.
                        Some(previous)
                            if previous.content_digest == job.digest
                                && previous.embedding.is_some() =>
                        {
                            Repository {
                                metadata: job.source.metadata,
                                ..previous
                            }
                        }
                        _ => Repository {
                            id: job.source.id.clone(),
                            metadata: job.source.metadata,
                            content_digest: job.digest,
                            embedding: None,
                            indexed_text: normalize_text(&job.text),
                            last_synced_at: now,
                            pending_reason: Some(reason.clone()),
                            tombstoned: false,
                        },
                    };
                    self.store.blocking(move |store| store.upsert(&record)).await?;
                    summary.record_failure(&job.source.id, reason);
                }
            }
        }
        Ok(())
    }
}

/// Drop entries with an empty id (recorded as failures) and keep only the
/// first occurrence of each id.
fn dedup_snapshot(snapshot: Vec<SourceRepo>, summary: &mut SyncSummary) -> Vec<SourceRepo> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(snapshot.len());
    for repo in snapshot {
        if repo.id.trim().is_empty() {
            summary.record_failure(&repo.id, "repository has an empty id");
            continue;
        }
        if !seen.insert(repo.id.clone()) {
            tracing::warn!("Duplicate repository {} in snapshot, keeping the first", repo.id);
            continue;
        }
        unique.push(repo);
    }
    unique
}

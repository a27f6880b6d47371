//! The local store: repository records plus the vector and text indexes
//! derived from them.
//!
//! Records are the source of truth. Each indexed record carries the
//! embedding and normalized text its index entries were built from, so the
//! indexes can always be repaired from the records after an interrupted
//! write.

pub mod records;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redb::Database;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{Repository, StoreStatus};
use crate::search::bm25::{normalize_text, Bm25Index};
use crate::search::vector::VectorIndex;
use records::RecordStore;

const DB_FILE: &str = "stars.redb";
const TEXT_DIR: &str = "text";

/// Inconsistencies found between the records and the two indexes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Tombstoned records whose delete had not finished
    pub finished_deletes: Vec<String>,
    /// Vector entries with no live indexed record
    pub orphan_vectors: Vec<String>,
    /// Text entries with no live indexed record
    pub orphan_text: Vec<String>,
    /// Indexed records whose vector entry was missing or stale
    pub restored_vectors: Vec<String>,
    /// Indexed records whose text entry was missing or stale
    pub restored_text: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.finished_deletes.len()
            + self.orphan_vectors.len()
            + self.orphan_text.len()
            + self.restored_vectors.len()
            + self.restored_text.len()
    }
}

/// Held for the duration of a sync or rebuild. Released on drop.
pub struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Store {
    records: RecordStore,
    vectors: VectorIndex,
    text: Bm25Index,
    embedding_dim: Option<usize>,
    syncing: AtomicBool,
    last_recovery: Mutex<ConsistencyReport>,
}

impl Store {
    /// Open (or create) the store under `data_dir` and repair any
    /// inconsistency left by an interrupted write.
    ///
    /// `embedding_dim` is the dimension of the configured model. A store
    /// locked to another dimension still opens, but refuses searches and
    /// syncs until a rebuild relocks it (see [`Store::rebuild_required`]).
    pub fn open(data_dir: &Path, embedding_dim: Option<usize>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let db_path = data_dir.join(DB_FILE);
        let db = Database::create(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
        let db = Arc::new(db);

        let records = RecordStore::open(db.clone())?;
        let vectors = VectorIndex::open(db, embedding_dim)?;
        let text = Bm25Index::open_or_create(&data_dir.join(TEXT_DIR))?;

        let store = Self {
            records,
            vectors,
            text,
            embedding_dim,
            syncing: AtomicBool::new(false),
            last_recovery: Mutex::new(ConsistencyReport::default()),
        };
        store.recover()?;
        if let Some(reason) = store.rebuild_required() {
            tracing::warn!("{reason}");
        }
        Ok(store)
    }

    /// Run a blocking store operation on tokio's blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("Store task failed")?
    }

    /// Insert or replace a record and bring both indexes in line with it.
    ///
    /// A record with an embedding gets a vector and a text entry; a pending
    /// record gets neither.
    pub fn upsert(&self, repo: &Repository) -> Result<()> {
        if let Some(embedding) = &repo.embedding {
            self.vectors.check_dimension(embedding.len())?;
        }

        self.records.put(repo)?;

        match &repo.embedding {
            Some(embedding) => {
                self.vectors.put(&repo.id, embedding)?;
                self.text.put(&repo.id, &repo.indexed_text)?;
            }
            None => {
                self.vectors.remove(&repo.id)?;
                self.text.remove(&repo.id)?;
            }
        }
        Ok(())
    }

    /// Rewrite a record without touching either index.
    ///
    /// For metadata-only changes: the record's embedding and indexed text
    /// must be the ones already indexed.
    pub fn put_record(&self, repo: &Repository) -> Result<()> {
        self.records.put(repo)
    }

    /// Delete a record and everything derived from it.
    ///
    /// The record is tombstoned first so a crash part-way through leaves a
    /// marker that [`Store::open`] finishes. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.records.mark_tombstoned(id)?;
        self.vectors.remove(id)?;
        self.text.remove(id)?;
        self.records.remove(id)?;
        Ok(existed)
    }

    /// Live (not tombstoned) record for `id`.
    pub fn get(&self, id: &str) -> Result<Option<Repository>> {
        Ok(self.records.get(id)?.filter(|r| !r.tombstoned))
    }

    /// Record for `id` as stored, tombstoned or not.
    pub fn record(&self, id: &str) -> Result<Option<Repository>> {
        self.records.get(id)
    }

    /// Every live record in id order.
    pub fn list_all(&self) -> Result<Vec<Repository>> {
        let mut records = self.records.list_all()?;
        records.retain(|r| !r.tombstoned);
        Ok(records)
    }

    /// Stamp `last_synced_at` on the given records.
    pub fn mark_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        self.records.touch_all(ids, at)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.records.last_sync_at()
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.records.set_last_sync_at(at)
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn text(&self) -> &Bm25Index {
        &self.text
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn dimension(&self) -> Option<usize> {
        self.vectors.dimension()
    }

    /// Why the store cannot serve the configured model, if it cannot.
    pub fn rebuild_required(&self) -> Option<String> {
        match (self.vectors.dimension(), self.embedding_dim) {
            (Some(stored), Some(configured)) if stored != configured => Some(format!(
                "store holds {stored}-dimensional vectors but the embedding model produces \
                 {configured}; a full rebuild is required"
            )),
            _ => None,
        }
    }

    /// Fails with [`Error::IndexCorruption`] while a rebuild is required.
    pub fn ensure_current_model(&self) -> Result<()> {
        match self.rebuild_required() {
            Some(reason) => Err(Error::IndexCorruption(reason)),
            None => Ok(()),
        }
    }

    /// Claim the store for a sync. A second claim while the first guard is
    /// alive fails with [`Error::ConcurrentSyncRejected`].
    pub fn try_begin_sync(&self) -> Result<SyncGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ConcurrentSyncRejected)?;
        Ok(SyncGuard {
            flag: &self.syncing,
        })
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let records = self.list_all()?;
        let pending = records.iter().filter(|r| r.is_pending()).count();
        Ok(StoreStatus {
            total_repositories: records.len(),
            pending_embeddings: pending,
            last_sync_at: self.last_sync_at()?,
            dimension: self.vectors.dimension(),
            vector_entries: self.vectors.len(),
            text_entries: self.text.len(),
            rebuild_required: self.rebuild_required(),
        })
    }

    /// Drop every embedding so the next sync re-embeds the whole collection.
    ///
    /// Clears the vector index (relocking it to the configured dimension),
    /// empties the text index and marks every record pending. Returns the
    /// number of records affected. The caller must hold the sync guard.
    pub fn reset_embeddings(&self) -> Result<usize> {
        if !self.is_syncing() {
            return Err(anyhow::anyhow!("reset_embeddings called without the sync guard").into());
        }

        let records = self.list_all()?;
        for repo in &records {
            let mut repo = repo.clone();
            repo.embedding = None;
            repo.pending_reason = Some("embeddings reset".to_string());
            self.records.put(&repo)?;
        }
        self.vectors.reset(self.embedding_dim)?;
        self.text.reset()?;

        tracing::info!("Reset embeddings for {} repositories", records.len());
        Ok(records.len())
    }

    /// Report from the recovery pass run at open.
    pub fn last_recovery(&self) -> ConsistencyReport {
        self.last_recovery.lock().clone()
    }

    /// Compare records against both indexes without changing anything.
    pub fn check(&self) -> Result<ConsistencyReport> {
        Ok(self.analyze()?.report)
    }

    /// Repair every inconsistency [`Store::check`] would report.
    pub fn recover(&self) -> Result<ConsistencyReport> {
        let plan = self.analyze()?;

        for id in &plan.report.finished_deletes {
            self.vectors.remove(id)?;
            self.text.remove(id)?;
            self.records.remove(id)?;
        }
        for id in &plan.report.orphan_vectors {
            self.vectors.remove(id)?;
        }
        for id in &plan.report.orphan_text {
            self.text.remove(id)?;
        }
        for id in &plan.report.restored_vectors {
            if let Some(repo) = plan.indexed.get(id) {
                if let Some(embedding) = &repo.embedding {
                    self.vectors.put(id, embedding)?;
                }
            }
        }
        for id in &plan.report.restored_text {
            if let Some(repo) = plan.indexed.get(id) {
                self.text.put(id, &repo.indexed_text)?;
            }
        }

        if plan.report.is_clean() {
            tracing::debug!("Store consistent, nothing to recover");
        } else {
            tracing::warn!(
                "Recovered store: {} unfinished deletes, {} orphan vectors, {} orphan text entries, \
                 {} vectors restored, {} text entries restored",
                plan.report.finished_deletes.len(),
                plan.report.orphan_vectors.len(),
                plan.report.orphan_text.len(),
                plan.report.restored_vectors.len(),
                plan.report.restored_text.len(),
            );
        }

        *self.last_recovery.lock() = plan.report.clone();
        Ok(plan.report)
    }

    fn analyze(&self) -> Result<RecoveryPlan> {
        let mut report = ConsistencyReport::default();
        let mut tombstoned = BTreeSet::new();
        let mut indexed = BTreeMap::new();

        for repo in self.records.list_all()? {
            if repo.tombstoned {
                tombstoned.insert(repo.id.clone());
                report.finished_deletes.push(repo.id);
            } else if repo.embedding.is_some() {
                indexed.insert(repo.id.clone(), repo);
            }
        }

        let is_orphan = |id: &String| !indexed.contains_key(id) && !tombstoned.contains(id);

        report.orphan_vectors = self.vectors.ids().into_iter().filter(is_orphan).collect();

        let text_entries = self.text.entries()?;
        report.orphan_text = text_entries.keys().filter(|id| is_orphan(id)).cloned().collect();

        for (id, repo) in &indexed {
            if self.vectors.get(id) != repo.embedding {
                report.restored_vectors.push(id.clone());
            }
            let expected = normalize_text(&repo.indexed_text);
            if text_entries.get(id) != Some(&expected) {
                report.restored_text.push(id.clone());
            }
        }

        Ok(RecoveryPlan { report, indexed })
    }
}

struct RecoveryPlan {
    report: ConsistencyReport,
    indexed: BTreeMap<String, Repository>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("vectors", &self.vectors.len())
            .field("text", &self.text.len())
            .field("dimension", &self.vectors.dimension())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RepoMetadata;

    fn indexed(id: &str, embedding: Vec<f32>, text: &str) -> Repository {
        Repository {
            id: id.to_string(),
            metadata: RepoMetadata {
                html_url: format!("https://github.com/{id}"),
                ..Default::default()
            },
            content_digest: format!("digest-{id}"),
            embedding: Some(embedding),
            indexed_text: normalize_text(text),
            last_synced_at: Utc::now(),
            pending_reason: None,
            tombstoned: false,
        }
    }

    #[test]
    fn test_upsert_populates_both_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        store.upsert(&indexed("a/b", vec![1.0, 0.0], "graph database")).unwrap();

        assert!(store.get("a/b").unwrap().is_some());
        assert!(store.vectors().contains("a/b"));
        assert_eq!(store.text().get("a/b").unwrap().as_deref(), Some("graph database"));
        assert!(store.check().unwrap().is_clean());
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        let repo = indexed("a/b", vec![1.0, 0.0], "graph database");
        store.upsert(&repo).unwrap();
        store.upsert(&repo).unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.total_repositories, 1);
        assert_eq!(status.vector_entries, 1);
        assert_eq!(status.text_entries, 1);
    }

    #[test]
    fn test_pending_record_has_no_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        let mut repo = indexed("a/b", vec![1.0, 0.0], "graph database");
        store.upsert(&repo).unwrap();

        repo.embedding = None;
        repo.pending_reason = Some("timeout".to_string());
        store.upsert(&repo).unwrap();

        assert!(!store.vectors().contains("a/b"));
        assert!(store.text().get("a/b").unwrap().is_none());
        assert_eq!(store.status().unwrap().pending_embeddings, 1);
        assert!(store.check().unwrap().is_clean());
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        let err = store
            .upsert(&indexed("a/b", vec![1.0, 0.0, 0.0], "text"))
            .unwrap_err();
        assert!(matches!(err, Error::IndexCorruption(_)));
        assert!(store.get("a/b").unwrap().is_none());
    }

    #[test]
    fn test_delete_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        store.upsert(&indexed("a/b", vec![1.0, 0.0], "graph database")).unwrap();

        assert!(store.delete("a/b").unwrap());
        assert!(store.get("a/b").unwrap().is_none());
        assert!(store.vectors().is_empty());
        assert!(store.text().is_empty());
        assert!(!store.delete("a/b").unwrap());
    }

    #[test]
    fn test_recover_finishes_interrupted_delete() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(2)).unwrap();
            store.upsert(&indexed("a/b", vec![1.0, 0.0], "graph database")).unwrap();
            store.upsert(&indexed("c/d", vec![0.0, 1.0], "web framework")).unwrap();
            // Crash right after the tombstone was committed.
            store.records.mark_tombstoned("a/b").unwrap();
            assert!(store.get("a/b").unwrap().is_none());
        }

        let store = Store::open(dir.path(), Some(2)).unwrap();
        let report = store.last_recovery();
        assert_eq!(report.finished_deletes, vec!["a/b".to_string()]);
        assert!(store.records.get("a/b").unwrap().is_none());
        assert!(!store.vectors().contains("a/b"));
        assert!(store.text().get("a/b").unwrap().is_none());
        assert!(store.get("c/d").unwrap().is_some());
        assert!(store.check().unwrap().is_clean());
    }

    #[test]
    fn test_recover_restores_missing_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(2)).unwrap();
            // Crash after the record write, before either index was updated.
            store
                .records
                .put(&indexed("a/b", vec![1.0, 0.0], "graph database"))
                .unwrap();
            let report = store.check().unwrap();
            assert_eq!(report.restored_vectors, vec!["a/b".to_string()]);
            assert_eq!(report.restored_text, vec!["a/b".to_string()]);
        }

        let store = Store::open(dir.path(), Some(2)).unwrap();
        assert_eq!(store.last_recovery().total(), 2);
        assert_eq!(store.vectors().get("a/b"), Some(vec![1.0, 0.0]));
        let hits = store.text().query(&["graph".to_string()], 10).unwrap();
        assert_eq!(hits[0].0, "a/b");
    }

    #[test]
    fn test_recover_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(2)).unwrap();
            store.vectors().put("ghost/repo", &[0.5, 0.5]).unwrap();
            store.text().put("ghost/repo", "haunted").unwrap();
        }

        let store = Store::open(dir.path(), Some(2)).unwrap();
        let report = store.last_recovery();
        assert_eq!(report.orphan_vectors, vec!["ghost/repo".to_string()]);
        assert_eq!(report.orphan_text, vec!["ghost/repo".to_string()]);
        assert!(store.vectors().is_empty());
        assert!(store.text().is_empty());
    }

    #[test]
    fn test_open_with_other_dimension_requires_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), Some(2)).unwrap();
            store.upsert(&indexed("a/b", vec![1.0, 0.0], "text")).unwrap();
        }

        let store = Store::open(dir.path(), Some(3)).unwrap();
        assert_eq!(store.dimension(), Some(2));
        assert!(store.get("a/b").unwrap().is_some());
        assert!(store.status().unwrap().rebuild_required.is_some());
        assert!(matches!(
            store.ensure_current_model(),
            Err(Error::IndexCorruption(_))
        ));

        let _guard = store.try_begin_sync().unwrap();
        store.reset_embeddings().unwrap();
        assert_eq!(store.dimension(), Some(3));
        assert!(store.ensure_current_model().is_ok());
        assert!(store.status().unwrap().rebuild_required.is_none());
    }

    #[test]
    fn test_concurrent_sync_rejected_until_guard_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();

        let guard = store.try_begin_sync().unwrap();
        assert!(matches!(
            store.try_begin_sync(),
            Err(Error::ConcurrentSyncRejected)
        ));
        drop(guard);
        assert!(store.try_begin_sync().is_ok());
    }

    #[test]
    fn test_reset_embeddings_marks_everything_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        store.upsert(&indexed("a/b", vec![1.0, 0.0], "one")).unwrap();
        store.upsert(&indexed("c/d", vec![0.0, 1.0], "two")).unwrap();

        let _guard = store.try_begin_sync().unwrap();
        assert_eq!(store.reset_embeddings().unwrap(), 2);
        let status = store.status().unwrap();
        assert_eq!(status.pending_embeddings, 2);
        assert_eq!(status.vector_entries, 0);
        assert_eq!(status.text_entries, 0);
        assert_eq!(status.dimension, Some(2));
        assert!(store.check().unwrap().is_clean());
    }

    #[test]
    fn test_reset_embeddings_requires_sync_guard() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        store.upsert(&indexed("a/b", vec![1.0, 0.0], "one")).unwrap();

        assert!(store.reset_embeddings().is_err());
        assert_eq!(store.status().unwrap().vector_entries, 1);
    }

    #[test]
    fn test_put_record_leaves_indexes_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        let mut repo = indexed("a/b", vec![1.0, 0.0], "graph database");
        store.upsert(&repo).unwrap();
        store.text().remove("a/b").unwrap();

        repo.metadata.stargazers_count = 42;
        store.put_record(&repo).unwrap();

        assert_eq!(store.get("a/b").unwrap().unwrap().metadata.stargazers_count, 42);
        // An index write would have put the text entry back.
        assert!(store.text().get("a/b").unwrap().is_none());
        assert_eq!(store.vectors().get("a/b"), Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_record_sees_tombstoned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Some(2)).unwrap();
        store.upsert(&indexed("a/b", vec![1.0, 0.0], "one")).unwrap();
        store.records.mark_tombstoned("a/b").unwrap();

        assert!(store.get("a/b").unwrap().is_none());
        assert!(store.record("a/b").unwrap().unwrap().tombstoned);
        assert!(store.record("x/y").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), Some(2)).unwrap());
        let repo = indexed("a/b", vec![1.0, 0.0], "one");

        store.blocking(move |s| s.upsert(&repo)).await.unwrap();
        let found = store.blocking(|s| s.get("a/b")).await.unwrap();
        assert!(found.is_some());
    }
}

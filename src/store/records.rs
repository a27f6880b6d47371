//! Repository records persisted in redb.
//!
//! Tables:
//! - `repos`: id (`owner/name`) -> [`Repository`] as JSON
//! - `store_meta`: key -> JSON value (currently only `last_sync_at`)

use anyhow::Context;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;

use crate::error::Result;
use crate::models::Repository;

const REPOS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("repos");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("store_meta");

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Source of truth for repository records, including the embedding and the
/// indexed text each index entry was built from.
pub struct RecordStore {
    db: Arc<Database>,
}

impl RecordStore {
    /// Open the record tables inside `db`, creating them if needed.
    pub fn open(db: Arc<Database>) -> Result<Self> {
        let write_txn = db
            .begin_write()
            .context("Failed to begin record table creation")?;
        write_txn
            .open_table(REPOS_TABLE)
            .context("Failed to create repos table")?;
        write_txn
            .open_table(META_TABLE)
            .context("Failed to create store_meta table")?;
        write_txn
            .commit()
            .context("Failed to commit record table creation")?;
        Ok(Self { db })
    }

    /// Fetch a record, tombstoned or not.
    pub fn get(&self, id: &str) -> Result<Option<Repository>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(REPOS_TABLE)
            .context("Failed to open repos table")?;
        match table.get(id).context("Failed to read record")? {
            Some(guard) => Ok(Some(deserialize(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a record.
    pub fn put(&self, repo: &Repository) -> Result<()> {
        let bytes = serialize(repo)?;
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(REPOS_TABLE)
                .context("Failed to open repos table")?;
            table
                .insert(repo.id.as_str(), bytes.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit record")?;
        Ok(())
    }

    /// Delete a record row. Returns whether one existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin delete")?;
        let existed = {
            let mut table = write_txn
                .open_table(REPOS_TABLE)
                .context("Failed to open repos table")?;
            let removed = table.remove(id).context("Failed to delete record")?;
            removed.is_some()
        };
        write_txn.commit().context("Failed to commit record delete")?;
        Ok(existed)
    }

    /// Flag a record as being deleted. Returns whether the record exists.
    pub fn mark_tombstoned(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let found = {
            let mut table = write_txn
                .open_table(REPOS_TABLE)
                .context("Failed to open repos table")?;
            let existing = table
                .get(id)
                .context("Failed to read record")?
                .map(|guard| guard.value().to_vec());
            match existing {
                Some(bytes) => {
                    let mut repo = deserialize(&bytes)?;
                    if !repo.tombstoned {
                        repo.tombstoned = true;
                        let bytes = serialize(&repo)?;
                        table
                            .insert(id, bytes.as_slice())
                            .context("Failed to write tombstone")?;
                    }
                    true
                }
                None => false,
            }
        };
        write_txn.commit().context("Failed to commit tombstone")?;
        Ok(found)
    }

    /// Set `last_synced_at` on every listed record in one transaction.
    /// Ids without a record are skipped. Returns how many were updated.
    pub fn touch_all(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let mut touched = 0;
        {
            let mut table = write_txn
                .open_table(REPOS_TABLE)
                .context("Failed to open repos table")?;
            for id in ids {
                let existing = table
                    .get(id.as_str())
                    .context("Failed to read record")?
                    .map(|guard| guard.value().to_vec());
                let Some(bytes) = existing else {
                    continue;
                };
                let mut repo = deserialize(&bytes)?;
                repo.last_synced_at = at;
                let bytes = serialize(&repo)?;
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .context("Failed to update sync time")?;
                touched += 1;
            }
        }
        write_txn.commit().context("Failed to commit sync times")?;
        Ok(touched)
    }

    /// Every record in id order, tombstoned ones included.
    pub fn list_all(&self) -> Result<Vec<Repository>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(REPOS_TABLE)
            .context("Failed to open repos table")?;
        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate records")? {
            let (_, value) = item.context("Failed to read record")?;
            records.push(deserialize(value.value())?);
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(REPOS_TABLE)
            .context("Failed to open repos table")?;
        let count = table.len().context("Failed to count records")?;
        Ok(count as usize)
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(META_TABLE)
            .context("Failed to open store_meta table")?;
        match table.get(LAST_SYNC_KEY).context("Failed to read last sync time")? {
            Some(guard) => {
                let at = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize last sync time")?;
                Ok(Some(at))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        let bytes = serde_json::to_vec(&at).context("Failed to serialize last sync time")?;
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(META_TABLE)
                .context("Failed to open store_meta table")?;
            table
                .insert(LAST_SYNC_KEY, bytes.as_slice())
                .context("Failed to write last sync time")?;
        }
        write_txn.commit().context("Failed to commit last sync time")?;
        Ok(())
    }
}

fn serialize(repo: &Repository) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(repo)
        .with_context(|| format!("Failed to serialize record {}", repo.id))?;
    Ok(bytes)
}

fn deserialize(bytes: &[u8]) -> Result<Repository> {
    let repo = serde_json::from_slice(bytes).context("Failed to deserialize record")?;
    Ok(repo)
}

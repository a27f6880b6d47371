use anyhow::Context;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// id -> embedding as little-endian f32 bytes
const VECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");
const VECTOR_META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("vector_meta");
const DIMENSION_KEY: &str = "dimension";

#[derive(Debug, Default)]
struct VectorState {
    entries: BTreeMap<String, Vec<f32>>,
    /// Locked for the lifetime of the store once set
    dimension: Option<usize>,
}

/// Vector index persisted in redb and scanned in memory by cosine similarity.
///
/// Every write commits to disk before the in-memory copy is updated, so a
/// reader never sees a vector that would be lost on restart.
pub struct VectorIndex {
    db: Arc<Database>,
    state: RwLock<VectorState>,
}

impl VectorIndex {
    /// Open the index inside `db`, loading all vectors into memory.
    ///
    /// `expected_dim` locks a fresh index. An index already locked keeps its
    /// stored dimension even if `expected_dim` differs; only
    /// [`VectorIndex::reset`] relocks it.
    pub fn open(db: Arc<Database>, expected_dim: Option<usize>) -> Result<Self> {
        {
            let write_txn = db
                .begin_write()
                .context("Failed to begin vector table creation")?;
            write_txn
                .open_table(VECTORS_TABLE)
                .context("Failed to create vectors table")?;
            write_txn
                .open_table(VECTOR_META_TABLE)
                .context("Failed to create vector_meta table")?;
            write_txn
                .commit()
                .context("Failed to commit vector table creation")?;
        }

        let (stored_dim, entries) = {
            let read_txn = db.begin_read().context("Failed to begin read")?;
            let meta = read_txn
                .open_table(VECTOR_META_TABLE)
                .context("Failed to open vector_meta table")?;
            let stored_dim = meta
                .get(DIMENSION_KEY)
                .context("Failed to read vector dimension")?
                .map(|guard| guard.value() as usize);

            let table = read_txn
                .open_table(VECTORS_TABLE)
                .context("Failed to open vectors table")?;
            let mut entries = BTreeMap::new();
            for item in table.iter().context("Failed to iterate vectors")? {
                let (key, value) = item.context("Failed to read vector entry")?;
                let id = key.value().to_string();
                let vector = decode_vector(value.value())
                    .ok_or_else(|| Error::IndexCorruption(format!("malformed vector for {id}")))?;
                entries.insert(id, vector);
            }
            (stored_dim, entries)
        };

        let dimension = match (stored_dim, expected_dim) {
            (Some(stored), _) => Some(stored),
            (None, Some(expected)) => {
                persist_dimension(&db, Some(expected))?;
                Some(expected)
            }
            (None, None) => None,
        };

        if let Some(dim) = dimension {
            if let Some((id, v)) = entries.iter().find(|(_, v)| v.len() != dim) {
                return Err(Error::IndexCorruption(format!(
                    "vector for {id} has {} dimensions, index is locked to {dim}",
                    v.len()
                )));
            }
        } else if !entries.is_empty() {
            return Err(Error::IndexCorruption(
                "vectors present but no dimension recorded".to_string(),
            ));
        }

        Ok(Self {
            db,
            state: RwLock::new(VectorState { entries, dimension }),
        })
    }

    /// Fails with [`Error::IndexCorruption`] if a vector of `len` dimensions
    /// could not be stored.
    pub fn check_dimension(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::IndexCorruption("empty vector".to_string()));
        }
        match self.state.read().dimension {
            Some(dim) if dim != len => Err(Error::IndexCorruption(format!(
                "vector has {len} dimensions, index is locked to {dim}"
            ))),
            _ => Ok(()),
        }
    }

    /// Insert or replace the vector for `id`. The first vector stored locks
    /// the index dimension.
    pub fn put(&self, id: &str, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::IndexCorruption("empty vector".to_string()));
        }
        let mut state = self.state.write();
        if let Some(dim) = state.dimension {
            if dim != vector.len() {
                return Err(Error::IndexCorruption(format!(
                    "vector for {id} has {} dimensions, index is locked to {dim}",
                    vector.len()
                )));
            }
        }
        let lock_dimension = state.dimension.is_none();

        let write_txn = self.db.begin_write().context("Failed to begin vector write")?;
        {
            let mut table = write_txn
                .open_table(VECTORS_TABLE)
                .context("Failed to open vectors table")?;
            let bytes = encode_vector(vector);
            table
                .insert(id, bytes.as_slice())
                .context("Failed to insert vector")?;
            if lock_dimension {
                let mut meta = write_txn
                    .open_table(VECTOR_META_TABLE)
                    .context("Failed to open vector_meta table")?;
                meta.insert(DIMENSION_KEY, vector.len() as u64)
                    .context("Failed to record vector dimension")?;
            }
        }
        write_txn.commit().context("Failed to commit vector")?;

        if lock_dimension {
            state.dimension = Some(vector.len());
        }
        state.entries.insert(id.to_string(), vector.to_vec());
        Ok(())
    }

    /// Remove the vector for `id`. Returns whether an entry existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write();
        let write_txn = self.db.begin_write().context("Failed to begin vector delete")?;
        let existed = {
            let mut table = write_txn
                .open_table(VECTORS_TABLE)
                .context("Failed to open vectors table")?;
            let removed = table.remove(id).context("Failed to delete vector")?;
            removed.is_some()
        };
        write_txn.commit().context("Failed to commit vector delete")?;
        state.entries.remove(id);
        Ok(existed)
    }

    /// Nearest neighbours of `query` by cosine similarity, best first.
    ///
    /// Equal scores are ordered by id ascending. An empty index yields an
    /// empty result for any query.
    pub fn query(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        let state = self.state.read();
        if state.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dim) = state.dimension {
            if query.len() != dim {
                return Err(Error::IndexCorruption(format!(
                    "query vector has {} dimensions, index is locked to {dim}",
                    query.len()
                )));
            }
        }

        let mut scored: Vec<(String, f32)> = state
            .entries
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }

    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.state.read().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        self.state.read().dimension
    }

    /// Drop every vector and relock the index to `dimension` (or leave it
    /// unlocked). Used when the embedding model changes.
    pub fn reset(&self, dimension: Option<usize>) -> Result<()> {
        let mut state = self.state.write();
        let write_txn = self.db.begin_write().context("Failed to begin vector reset")?;
        write_txn
            .delete_table(VECTORS_TABLE)
            .context("Failed to drop vectors table")?;
        write_txn
            .open_table(VECTORS_TABLE)
            .context("Failed to recreate vectors table")?;
        {
            let mut meta = write_txn
                .open_table(VECTOR_META_TABLE)
                .context("Failed to open vector_meta table")?;
            match dimension {
                Some(dim) => {
                    meta.insert(DIMENSION_KEY, dim as u64)
                        .context("Failed to record vector dimension")?;
                }
                None => {
                    meta.remove(DIMENSION_KEY)
                        .context("Failed to clear vector dimension")?;
                }
            }
        }
        write_txn.commit().context("Failed to commit vector reset")?;

        state.entries.clear();
        state.dimension = dimension;
        Ok(())
    }
}

fn persist_dimension(db: &Database, dimension: Option<usize>) -> Result<()> {
    let write_txn = db.begin_write().context("Failed to begin dimension write")?;
    {
        let mut meta = write_txn
            .open_table(VECTOR_META_TABLE)
            .context("Failed to open vector_meta table")?;
        if let Some(dim) = dimension {
            meta.insert(DIMENSION_KEY, dim as u64)
                .context("Failed to record vector dimension")?;
        }
    }
    write_txn.commit().context("Failed to commit vector dimension")?;
    Ok(())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VectorIndex")
            .field("entries", &state.entries.len())
            .field("dimension", &state.dimension)
            .finish()
    }
}

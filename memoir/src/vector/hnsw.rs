//! HNSW-backed vector index, separate from the metadata store.
//!
//! Wraps `hnsw_rs::Hnsw<f32, DistCosine>` with a bidirectional memory-id
//! <-> internal-usize-id map, soft-delete via a `HashSet`, and a metadata
//! equality filter (tenant isolation and the session/source/kind scoping
//! a query chooses to apply).
//!
//! `hnsw_rs` graphs can't be reloaded directly (its `HnswIo` loader has
//! lifetime constraints that don't fit a long-lived struct), so on restart
//! the graph is rebuilt from the raw vectors persisted alongside the index,
//! the same strategy used for PulseDB's collective indices.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Clone, Debug)]
pub struct HnswConfig {
    pub max_nb_connection: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layer: usize,
    pub max_elements: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_nb_connection: 16,
            ef_construction: 200,
            ef_search: 50,
            max_layer: 16,
            max_elements: 10_000,
        }
    }
}

/// A vector plus the equality-filterable metadata it was inserted under
/// (at minimum `user_id`; callers also pass `session_id`, `source`, `kind`).
#[derive(Clone, Debug)]
pub struct VectorRecord {
    pub id: String,
    pub metadata: HashMap<String, String>,
    pub embedding: Vec<f32>,
}

struct IndexState {
    id_to_internal: HashMap<String, usize>,
    internal_to_id: Vec<String>,
    internal_to_metadata: Vec<HashMap<String, String>>,
    // Kept alongside the graph purely so `save()` can persist a rebuildable
    // dump; hnsw_rs exposes no way to read a point's vector back out.
    internal_to_embedding: Vec<Vec<f32>>,
    deleted: HashSet<usize>,
    next_id: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    id: String,
    metadata: HashMap<String, String>,
    embedding: Vec<f32>,
    deleted: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dimension: usize,
    records: Vec<PersistedRecord>,
}

/// Directory-persisted HNSW vector store. One instance spans every tenant;
/// queries are scoped with an equality filter over chosen metadata keys
/// rather than one index per tenant, since memory counts per agent are small.
pub struct VectorStore {
    hnsw: Hnsw<'static, f32, DistCosine>,
    state: RwLock<IndexState>,
    dimension: usize,
    dir: PathBuf,
}

const INDEX_FILE: &str = "vectors.json";

impl VectorStore {
    pub fn new(dimension: usize, dir: PathBuf, config: &HnswConfig) -> Self {
        let hnsw = Hnsw::new(
            config.max_nb_connection,
            config.max_elements,
            config.max_layer,
            config.ef_construction,
            DistCosine,
        );
        Self {
            hnsw,
            state: RwLock::new(IndexState {
                id_to_internal: HashMap::new(),
                internal_to_id: Vec::new(),
                internal_to_metadata: Vec::new(),
                internal_to_embedding: Vec::new(),
                deleted: HashSet::new(),
                next_id: 0,
            }),
            dimension,
            dir,
        }
    }

    /// Opens a store at `dir`, rebuilding the HNSW graph from the persisted
    /// vector dump if one exists. Returns a fresh empty store otherwise.
    pub fn open(dimension: usize, dir: PathBuf, config: &HnswConfig) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::new(dimension, dir, config));
        }

        let json = fs::read_to_string(&path)?;
        let persisted: PersistedIndex = serde_json::from_str(&json)?;
        if persisted.dimension != dimension {
            return Err(EngineError::VectorUpsertError(format!(
                "persisted index dimension {} does not match configured dimension {dimension}",
                persisted.dimension
            )));
        }

        let store = Self::new(dimension, dir, config);
        {
            let mut state = store.state.write().expect("state lock poisoned");
            let mut batch: Vec<(&Vec<f32>, usize)> = Vec::with_capacity(persisted.records.len());
            for record in &persisted.records {
                let internal_id = state.next_id;
                state.next_id += 1;
                state.id_to_internal.insert(record.id.clone(), internal_id);
                state.internal_to_id.push(record.id.clone());
                state.internal_to_metadata.push(record.metadata.clone());
                state.internal_to_embedding.push(record.embedding.clone());
                if record.deleted {
                    state.deleted.insert(internal_id);
                }
                batch.push((&record.embedding, internal_id));
            }
            if !batch.is_empty() {
                store.hnsw.parallel_insert(&batch);
            }
        }

        Ok(store)
    }

    /// Idempotent on `id`: a prior entry under the same id is soft-deleted
    /// and a fresh point inserted under a new internal id, since hnsw_rs
    /// has no in-place update.
    pub fn upsert(&self, record: &VectorRecord) -> Result<()> {
        if record.embedding.len() != self.dimension {
            return Err(EngineError::VectorUpsertError(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                record.embedding.len()
            )));
        }

        let mut state = self.state.write().expect("state lock poisoned");
        if let Some(&internal_id) = state.id_to_internal.get(&record.id) {
            state.deleted.insert(internal_id);
        }

        let internal_id = state.next_id;
        state.next_id += 1;
        state.id_to_internal.insert(record.id.clone(), internal_id);
        state.internal_to_id.push(record.id.clone());
        state.internal_to_metadata.push(record.metadata.clone());
        state.internal_to_embedding.push(record.embedding.clone());
        drop(state);

        self.hnsw.insert((&record.embedding, internal_id));
        self.save()
    }

    /// Best-effort: deleting an id that isn't present is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().expect("state lock poisoned");
        if let Some(&internal_id) = state.id_to_internal.get(id) {
            state.deleted.insert(internal_id);
        }
        drop(state);
        self.save()
    }

    /// Searches for the `k` nearest neighbours, excluding soft-deleted
    /// entries and those failing the equality `filter` (AND-combined;
    /// an empty filter means no restriction). Results are `(id, similarity)`
    /// sorted descending (cosine similarity = 1 - cosine distance).
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        ef_search: usize,
        filter: &[(&str, &str)],
    ) -> Result<Vec<(String, f32)>> {
        if vector.len() != self.dimension {
            return Err(EngineError::VectorUpsertError(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        let state = self.state.read().expect("state lock poisoned");
        let deleted = &state.deleted;
        let metadata = &state.internal_to_metadata;
        let matches = |internal_id: &usize| -> bool {
            !deleted.contains(internal_id)
                && metadata.get(*internal_id).is_some_and(|m| {
                    filter.iter().all(|(key, value)| m.get(*key).is_some_and(|v| v == value))
                })
        };

        let results = if filter.is_empty() && deleted.is_empty() {
            self.hnsw.search(vector, k, ef_search)
        } else {
            self.hnsw.search_filter(vector, k, ef_search, Some(&matches))
        };

        Ok(results
            .into_iter()
            .filter_map(|n| {
                state
                    .internal_to_id
                    .get(n.d_id)
                    .map(|id| (id.clone(), 1.0 - n.distance))
            })
            .collect())
    }

    pub fn count(&self) -> usize {
        let state = self.state.read().expect("state lock poisoned");
        state.id_to_internal.len() - state.deleted.len()
    }

    /// Persists the full index to the JSON sidecar. Called after every
    /// `upsert`/`delete` so the on-disk copy is never more than one
    /// mutation behind — `open()` has no other source of truth to rebuild
    /// the graph from on restart.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let state = self.state.read().expect("state lock poisoned");

        let records: Vec<PersistedRecord> = state
            .internal_to_id
            .iter()
            .enumerate()
            .map(|(internal_id, id)| PersistedRecord {
                id: id.clone(),
                metadata: state.internal_to_metadata[internal_id].clone(),
                embedding: state.internal_to_embedding[internal_id].clone(),
                deleted: state.deleted.contains(&internal_id),
            })
            .collect();

        let persisted = PersistedIndex { dimension: self.dimension, records };
        let json = serde_json::to_string(&persisted)?;
        fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim).map(|i| (seed as f32 * 0.1 + i as f32 * 0.01).sin()).collect()
    }

    fn meta(user_id: &str) -> HashMap<String, String> {
        HashMap::from([("user_id".to_string(), user_id.to_string())])
    }

    #[test]
    fn insert_and_query_scoped_to_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(8, dir.path().to_path_buf(), &HnswConfig::default());

        for i in 0..5u64 {
            store
                .upsert(&VectorRecord { id: format!("m{i}"), metadata: meta("alice"), embedding: embedding(i, 8) })
                .unwrap();
        }
        store
            .upsert(&VectorRecord { id: "other".into(), metadata: meta("bob"), embedding: embedding(0, 8) })
            .unwrap();

        let results = store.query(&embedding(0, 8), 10, 50, &[("user_id", "alice")]).unwrap();
        assert!(results.iter().all(|(id, _)| id != "other"));
        assert_eq!(store.count(), 6);
    }

    #[test]
    fn delete_excludes_from_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(4, dir.path().to_path_buf(), &HnswConfig::default());
        store
            .upsert(&VectorRecord { id: "m1".into(), metadata: meta("alice"), embedding: embedding(1, 4) })
            .unwrap();
        store.delete("m1").unwrap();

        let results = store.query(&embedding(1, 4), 5, 50, &[("user_id", "alice")]).unwrap();
        assert!(results.is_empty());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(8, dir.path().to_path_buf(), &HnswConfig::default());
        let err = store
            .upsert(&VectorRecord { id: "m1".into(), metadata: meta("alice"), embedding: vec![0.0; 4] })
            .unwrap_err();
        assert!(matches!(err, EngineError::VectorUpsertError(_)));
    }

    #[test]
    fn upsert_replaces_prior_vector_for_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(4, dir.path().to_path_buf(), &HnswConfig::default());
        store.upsert(&VectorRecord { id: "m1".into(), metadata: meta("alice"), embedding: embedding(1, 4) }).unwrap();
        store.upsert(&VectorRecord { id: "m1".into(), metadata: meta("alice"), embedding: embedding(2, 4) }).unwrap();
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(4, dir.path().to_path_buf(), &HnswConfig::default());
        store.upsert(&VectorRecord { id: "m1".into(), metadata: meta("alice"), embedding: embedding(1, 4) }).unwrap();
        let results = store.query(&embedding(1, 4), 5, 50, &[]).unwrap();
        assert_eq!(results.len(), 1);
    }
}

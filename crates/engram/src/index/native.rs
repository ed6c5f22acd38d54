//! Native HNSW vector index backed by usearch.
//!
//! usearch keys are sequential u64s; a bidirectional key <-> chunk-id map
//! travels with the index as a JSON sidecar (`<path>.map.json`). Snapshots
//! of both files are written to temp paths and renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{atomic_write, check_insert_shape, IndexStats, VectorHit, VectorIndex};

const INITIAL_CAPACITY: usize = 4096;

struct NativeState {
    index: usearch::Index,
    dimension: usize,
    forward: HashMap<u64, Uuid>,
    reverse: HashMap<Uuid, u64>,
    next_key: u64,
}

#[derive(Serialize, Deserialize)]
struct Mapping {
    dimension: usize,
    next_key: u64,
    entries: Vec<(u64, Uuid)>,
}

pub struct NativeVectorIndex {
    inner: RwLock<NativeState>,
}

fn index_options(dimension: usize) -> IndexOptions {
    IndexOptions {
        dimensions: dimension,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: 16,
        expansion_add: 128,
        expansion_search: 64,
        multi: false,
    }
}

fn mapping_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".map.json");
    path.with_file_name(name)
}

impl NativeVectorIndex {
    pub fn new(dimension: usize) -> Result<Self> {
        let index = usearch::Index::new(&index_options(dimension))
            .map_err(|e| EngineError::index(format!("usearch init: {}", e)))?;
        index
            .reserve(INITIAL_CAPACITY)
            .map_err(|e| EngineError::index(format!("usearch reserve: {}", e)))?;
        Ok(Self {
            inner: RwLock::new(NativeState {
                index,
                dimension,
                forward: HashMap::new(),
                reverse: HashMap::new(),
                next_key: 0,
            }),
        })
    }

    fn ensure_capacity(state: &NativeState, additional: usize) -> Result<()> {
        let needed = state.index.size() + additional;
        let capacity = state.index.capacity();
        if needed >= capacity {
            state
                .index
                .reserve((capacity * 2).max(needed + INITIAL_CAPACITY))
                .map_err(|e| EngineError::index(format!("usearch reserve: {}", e)))?;
        }
        Ok(())
    }
}

impl VectorIndex for NativeVectorIndex {
    fn insert(&self, ids: &[Uuid], vectors: &[Vec<f32>]) -> Result<()> {
        let mut state = self.inner.write();
        check_insert_shape(ids, vectors, state.dimension)?;
        Self::ensure_capacity(&state, ids.len())?;

        for (id, vector) in ids.iter().zip(vectors.iter()) {
            // Re-inserting an id replaces its vector.
            if let Some(old_key) = state.reverse.remove(id) {
                let _ = state.index.remove(old_key);
                state.forward.remove(&old_key);
            }
            let key = state.next_key;
            state
                .index
                .add(key, vector)
                .map_err(|e| EngineError::index(format!("usearch add: {}", e)))?;
            state.next_key += 1;
            state.forward.insert(key, *id);
            state.reverse.insert(*id, key);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let state = self.inner.read();
        if query.len() != state.dimension {
            return Err(EngineError::index(format!(
                "query length {} does not match index dimension {}",
                query.len(),
                state.dimension
            )));
        }
        if k == 0 || state.index.size() == 0 {
            return Ok(Vec::new());
        }

        let matches = state
            .index
            .search(query, k)
            .map_err(|e| EngineError::index(format!("usearch search: {}", e)))?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(id) = state.forward.get(key) {
                hits.push(VectorHit {
                    id: *id,
                    score: (1.0 - distance).clamp(0.0, 1.0),
                });
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn delete(&self, ids: &[Uuid]) -> Result<()> {
        let mut state = self.inner.write();
        for id in ids {
            if let Some(key) = state.reverse.remove(id) {
                state
                    .index
                    .remove(key)
                    .map_err(|e| EngineError::index(format!("usearch remove: {}", e)))?;
                state.forward.remove(&key);
            }
        }
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        let state = self.inner.read();
        IndexStats {
            total: state.forward.len(),
            dimension: state.dimension,
            native_mode: true,
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let state = self.inner.read();

        let tmp = path.with_extension("usearch.tmp");
        state
            .index
            .save(tmp.to_string_lossy().as_ref())
            .map_err(|e| EngineError::index(format!("usearch save: {}", e)))?;
        std::fs::rename(&tmp, path)?;

        let mapping = Mapping {
            dimension: state.dimension,
            next_key: state.next_key,
            entries: state.forward.iter().map(|(k, v)| (*k, *v)).collect(),
        };
        let json = serde_json::to_vec(&mapping)
            .map_err(|e| EngineError::index(format!("mapping serialize: {}", e)))?;
        atomic_write(&mapping_path(path), &json)
    }

    fn load(&self, path: &Path) -> Result<()> {
        let mapping_file = mapping_path(path);
        let json = std::fs::read(&mapping_file)?;
        let mapping: Mapping = serde_json::from_slice(&json).map_err(|e| {
            EngineError::index(format!(
                "corrupted mapping {}: {}",
                mapping_file.display(),
                e
            ))
        })?;

        let mut state = self.inner.write();
        if mapping.dimension != state.dimension {
            return Err(EngineError::index(format!(
                "snapshot dimension {} does not match index dimension {}",
                mapping.dimension, state.dimension
            )));
        }

        let index = usearch::Index::new(&index_options(state.dimension))
            .map_err(|e| EngineError::index(format!("usearch init: {}", e)))?;
        index
            .load(path.to_string_lossy().as_ref())
            .map_err(|e| EngineError::index(format!("corrupted snapshot {}: {}", path.display(), e)))?;

        if index.size() != mapping.entries.len() {
            return Err(EngineError::index(format!(
                "snapshot {} holds {} vectors but mapping lists {}",
                path.display(),
                index.size(),
                mapping.entries.len()
            )));
        }

        state.index = index;
        state.next_key = mapping.next_key;
        state.forward = mapping.entries.iter().cloned().collect();
        state.reverse = mapping.entries.into_iter().map(|(k, v)| (v, k)).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_for(seed: f32, dimension: usize) -> Vec<f32> {
        (0..dimension).map(|i| (seed + i as f32).cos()).collect()
    }

    #[test]
    fn insert_search_delete() {
        let index = NativeVectorIndex::new(8).unwrap();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let vectors: Vec<Vec<f32>> = (0..3).map(|i| vec_for(i as f32, 8)).collect();
        index.insert(&ids, &vectors).unwrap();

        let hits = index.search(&vectors[1], 1).unwrap();
        assert_eq!(hits[0].id, ids[1]);
        assert!(hits[0].score >= 0.999);

        index.delete(&[ids[1]]).unwrap();
        index.delete(&[ids[1]]).unwrap();
        assert_eq!(index.stats().total, 2);
        let hits = index.search(&vectors[1], 3).unwrap();
        assert!(hits.iter().all(|h| h.id != ids[1]));
    }

    #[test]
    fn reinsert_replaces_vector() {
        let index = NativeVectorIndex::new(4).unwrap();
        let id = Uuid::new_v4();
        index.insert(&[id], &[vec![1.0, 0.0, 0.0, 0.0]]).unwrap();
        index.insert(&[id], &[vec![0.0, 1.0, 0.0, 0.0]]).unwrap();
        assert_eq!(index.stats().total, 1);

        let hits = index.search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].score >= 0.999);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let index = NativeVectorIndex::new(4).unwrap();
        let err = index.insert(&[Uuid::new_v4()], &[vec![0.0; 8]]).unwrap_err();
        assert!(matches!(err, EngineError::IndexConsistency(_)));
        assert_eq!(index.stats().total, 0);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.usearch");

        let index = NativeVectorIndex::new(8).unwrap();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| vec_for(i as f32 * 0.7, 8)).collect();
        index.insert(&ids, &vectors).unwrap();
        index.save(&path).unwrap();

        let restored = NativeVectorIndex::new(8).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.stats(), index.stats());
        let hits = restored.search(&vectors[0], 1).unwrap();
        assert_eq!(hits[0].id, ids[0]);
    }

    #[test]
    fn load_rejects_missing_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.usearch");
        std::fs::write(&path, b"binary junk").unwrap();
        let index = NativeVectorIndex::new(8).unwrap();
        assert!(index.load(&path).is_err());
    }
}

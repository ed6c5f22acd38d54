//! Portable brute-force vector index.
//!
//! Exhaustive cosine scan, parallelized with rayon. Exact recall, no native
//! dependencies; the trade is O(n) search. Entries live in a BTreeMap so
//! iteration order (and therefore tie handling) is deterministic.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{atomic_write, check_insert_shape, cosine_score, IndexStats, VectorHit, VectorIndex};

struct FlatState {
    dimension: usize,
    entries: BTreeMap<Uuid, Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    entries: Vec<(Uuid, Vec<f32>)>,
}

pub struct FlatVectorIndex {
    inner: RwLock<FlatState>,
}

impl FlatVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: RwLock::new(FlatState {
                dimension,
                entries: BTreeMap::new(),
            }),
        }
    }
}

impl VectorIndex for FlatVectorIndex {
    fn insert(&self, ids: &[Uuid], vectors: &[Vec<f32>]) -> Result<()> {
        let mut state = self.inner.write();
        check_insert_shape(ids, vectors, state.dimension)?;
        for (id, vector) in ids.iter().zip(vectors.iter()) {
            state.entries.insert(*id, vector.clone());
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
        if k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<VectorHit> = state
            .entries
            .par_iter()
            .map(|(id, vector)| VectorHit {
                id: *id,
                score: cosine_score(query, vector),
            })
            .collect();

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
            state.entries.remove(id);
        }
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        let state = self.inner.read();
        IndexStats {
            total: state.entries.len(),
            dimension: state.dimension,
            native_mode: false,
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let state = self.inner.read();
        let snapshot = Snapshot {
            dimension: state.dimension,
            entries: state.entries.iter().map(|(k, v)| (*k, v.clone())).collect(),
        };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| EngineError::index(format!("snapshot serialize: {}", e)))?;
        atomic_write(path, &json)
    }

    fn load(&self, path: &Path) -> Result<()> {
        let json = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&json)
            .map_err(|e| EngineError::index(format!("corrupted snapshot {}: {}", path.display(), e)))?;

        let mut state = self.inner.write();
        if snapshot.dimension != state.dimension {
            return Err(EngineError::index(format!(
                "snapshot dimension {} does not match index dimension {}",
                snapshot.dimension, state.dimension
            )));
        }
        for (_, vector) in &snapshot.entries {
            if vector.len() != snapshot.dimension {
                return Err(EngineError::index(format!(
                    "corrupted snapshot {}: entry length {} != dimension {}",
                    path.display(),
                    vector.len(),
                    snapshot.dimension
                )));
            }
        }
        state.entries = snapshot.entries.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_for(seed: f32, dimension: usize) -> Vec<f32> {
        (0..dimension).map(|i| (seed + i as f32).sin()).collect()
    }

    #[test]
    fn insert_and_search_self() {
        let index = FlatVectorIndex::new(8);
        let id = Uuid::new_v4();
        let v = vec_for(0.3, 8);
        index.insert(&[id], &[v.clone()]).unwrap();

        let hits = index.search(&v, 1).unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].score >= 0.999);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let index = FlatVectorIndex::new(4);
        let id = Uuid::new_v4();
        let err = index.insert(&[id], &[vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, EngineError::IndexConsistency(_)));
        assert_eq!(index.stats().total, 0);
    }

    #[test]
    fn rejects_non_parallel_arrays() {
        let index = FlatVectorIndex::new(4);
        let err = index
            .insert(&[Uuid::new_v4(), Uuid::new_v4()], &[vec![0.0; 4]])
            .unwrap_err();
        assert!(matches!(err, EngineError::IndexConsistency(_)));
    }

    #[test]
    fn delete_is_idempotent() {
        let index = FlatVectorIndex::new(4);
        let id = Uuid::new_v4();
        index.insert(&[id], &[vec![1.0, 0.0, 0.0, 0.0]]).unwrap();
        index.delete(&[id]).unwrap();
        index.delete(&[id]).unwrap();
        assert_eq!(index.stats().total, 0);
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn ties_break_by_id() {
        let index = FlatVectorIndex::new(2);
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        // Identical vectors: all scores tie, so output order must be id order.
        let vectors = vec![vec![1.0, 0.0]; 3];
        index.insert(&ids, &vectors).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        ids.sort();
        let got: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.index.json");

        let index = FlatVectorIndex::new(6);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let vectors: Vec<Vec<f32>> = (0..5).map(|i| vec_for(i as f32, 6)).collect();
        index.insert(&ids, &vectors).unwrap();
        index.save(&path).unwrap();

        let restored = FlatVectorIndex::new(6);
        restored.load(&path).unwrap();
        assert_eq!(restored.stats(), index.stats());

        let hits = restored.search(&vectors[2], 1).unwrap();
        assert_eq!(hits[0].id, ids[2]);
    }

    #[test]
    fn load_rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.index.json");
        let index = FlatVectorIndex::new(4);
        index.save(&path).unwrap();

        let other = FlatVectorIndex::new(8);
        assert!(other.load(&path).is_err());
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.index.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let index = FlatVectorIndex::new(4);
        assert!(matches!(
            index.load(&path),
            Err(EngineError::IndexConsistency(_))
        ));
    }
}

pub mod flat;
pub mod manager;
pub mod native;

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use flat::FlatVectorIndex;
pub use manager::{IndexManager, RebuildPhase, RebuildProgress};
pub use native::NativeVectorIndex;

/// A single nearest-neighbor match. Scores are in [0, 1], higher = closer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub id: Uuid,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total: usize,
    pub dimension: usize,
    pub native_mode: bool,
}

/// Fixed-dimension ANN index contract shared by the native (usearch) and
/// portable (brute-force) implementations. Only persistence format and
/// recall-vs-speed differ between the two.
///
/// Implementations are internally synchronized: concurrent readers are
/// allowed, inserts are serialized.
pub trait VectorIndex: Send + Sync {
    /// Insert parallel `ids` / `vectors` arrays. A length mismatch between
    /// the arrays, or any vector whose length differs from the index
    /// dimension, is an `IndexConsistency` error and inserts nothing.
    fn insert(&self, ids: &[Uuid], vectors: &[Vec<f32>]) -> Result<()>;

    /// Top-k nearest neighbors; ties broken by id for determinism.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// Remove entries; unknown ids are ignored (idempotent).
    fn delete(&self, ids: &[Uuid]) -> Result<()>;

    fn stats(&self) -> IndexStats;

    /// Atomic snapshot: written to a temp file and renamed into place, so a
    /// partially written file is never observed by `load`.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replace the index contents from a snapshot written by `save`.
    fn load(&self, path: &Path) -> Result<()>;
}

/// Validation shared by both implementations.
pub(crate) fn check_insert_shape(
    ids: &[Uuid],
    vectors: &[Vec<f32>],
    dimension: usize,
) -> Result<()> {
    if ids.len() != vectors.len() {
        return Err(crate::error::EngineError::index(format!(
            "ids and vectors are not parallel: {} ids, {} vectors",
            ids.len(),
            vectors.len()
        )));
    }
    for vector in vectors {
        if vector.len() != dimension {
            return Err(crate::error::EngineError::index(format!(
                "vector length {} does not match index dimension {}",
                vector.len(),
                dimension
            )));
        }
    }
    Ok(())
}

/// Write `contents` to `path` atomically: temp file, fsync, rename.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Cosine similarity mapped to [0, 1] (negative similarity floors at 0).
pub(crate) fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_score_bounds() {
        assert!((cosine_score(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_score(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_score(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn shape_check_rejects_mismatches() {
        let id = Uuid::new_v4();
        assert!(check_insert_shape(&[id], &[vec![0.0; 3]], 3).is_ok());
        assert!(check_insert_shape(&[id], &[], 3).is_err());
        assert!(check_insert_shape(&[id], &[vec![0.0; 2]], 3).is_err());
    }
}

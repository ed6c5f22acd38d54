//! Vector-index lifecycle: per-character sub-indices, dimension-drift
//! detection, and full or scoped rebuilds when the embedding model changes.
//!
//! Placement rule: chunks owned by a character live in that character's
//! sub-index, everything else in the primary index. All indices share one
//! dimension; changing it means a full rebuild.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::providers::{with_retry, EmbeddingProvider, RetryPolicy};
use crate::storage::ChunkStore;
use crate::types::{MemoryFilter, MemorySource};

use super::{FlatVectorIndex, IndexStats, NativeVectorIndex, VectorHit, VectorIndex};

const KV_DIMENSION: &str = "index.dimension";
const KV_MODEL: &str = "embedding.model_id";

/// Rows scanned and embedded per rebuild step.
const REBUILD_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Native,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPhase {
    Deleting,
    Reading,
    Embedding,
    Inserting,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildProgress {
    pub phase: RebuildPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionReport {
    pub mismatched: bool,
    pub index_dim: usize,
    pub config_dim: usize,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub scanned: usize,
    pub embedded: usize,
    pub dimension: usize,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(RebuildProgress) + Send + Sync);

pub struct IndexManager {
    store: Arc<ChunkStore>,
    kind: IndexKind,
    indices_dir: PathBuf,
    dimension: RwLock<usize>,
    primary: RwLock<Arc<dyn VectorIndex>>,
    characters: DashMap<String, Arc<dyn VectorIndex>>,
    retry: RetryPolicy,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

impl IndexManager {
    /// Open the manager, restoring the primary index snapshot when one
    /// exists. The dimension persisted in `kv_store` wins over the
    /// configured one, so a previously rebuilt index keeps working even if
    /// the config lags behind.
    pub fn open(
        store: Arc<ChunkStore>,
        kind: IndexKind,
        data_dir: &std::path::Path,
        configured_dimension: usize,
    ) -> Result<Self> {
        let indices_dir = data_dir.join("indices");
        std::fs::create_dir_all(&indices_dir)?;

        let dimension = store
            .kv_get(KV_DIMENSION)?
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(configured_dimension);

        let manager = Self {
            store,
            kind,
            indices_dir,
            dimension: RwLock::new(dimension),
            primary: RwLock::new(Self::make_index(kind, dimension)?),
            characters: DashMap::new(),
            retry: RetryPolicy::default(),
        };

        let primary_path = manager.index_file("primary");
        if primary_path.exists() {
            let primary = manager.primary.read().clone();
            if let Err(err) = primary.load(&primary_path) {
                tracing::warn!(
                    path = %primary_path.display(),
                    error = %err,
                    "Failed to load primary index snapshot, starting empty"
                );
            }
        }
        Ok(manager)
    }

    fn make_index(kind: IndexKind, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
        Ok(match kind {
            IndexKind::Native => Arc::new(NativeVectorIndex::new(dimension)?),
            IndexKind::Flat => Arc::new(FlatVectorIndex::new(dimension)),
        })
    }

    fn index_file(&self, name: &str) -> PathBuf {
        let file = match self.kind {
            IndexKind::Native => format!("{}.usearch", sanitize(name)),
            IndexKind::Flat => format!("{}.flat.json", sanitize(name)),
        };
        self.indices_dir.join(file)
    }

    pub fn dimension(&self) -> usize {
        *self.dimension.read()
    }

    pub fn primary(&self) -> Arc<dyn VectorIndex> {
        self.primary.read().clone()
    }

    /// Lazily load (or create) a character's sub-index.
    pub fn character_index(&self, character: &str) -> Result<Arc<dyn VectorIndex>> {
        if let Some(index) = self.characters.get(character) {
            return Ok(index.clone());
        }
        let index = Self::make_index(self.kind, self.dimension())?;
        let path = self.index_file(character);
        if path.exists() {
            index.load(&path)?;
        }
        self.characters.insert(character.to_string(), index.clone());
        Ok(index)
    }

    fn scoped(&self, character: Option<&str>) -> Result<Arc<dyn VectorIndex>> {
        match character {
            Some(character) => self.character_index(character),
            None => Ok(self.primary()),
        }
    }

    pub fn insert_scoped(
        &self,
        character: Option<&str>,
        ids: &[Uuid],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        self.scoped(character)?.insert(ids, vectors)
    }

    /// Search one scope: a character's sub-index, or the primary index.
    pub fn search_scoped(
        &self,
        character: Option<&str>,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        self.scoped(character)?.search(query, k)
    }

    /// Fan out across the primary index and every loaded sub-index, union
    /// by id keeping the best score.
    pub fn search_union(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let mut best: std::collections::HashMap<Uuid, f32> = std::collections::HashMap::new();
        for hit in self.primary().search(query, k)? {
            best.entry(hit.id)
                .and_modify(|s| *s = s.max(hit.score))
                .or_insert(hit.score);
        }
        for entry in self.characters.iter() {
            for hit in entry.value().search(query, k)? {
                best.entry(hit.id)
                    .and_modify(|s| *s = s.max(hit.score))
                    .or_insert(hit.score);
            }
        }
        let mut hits: Vec<VectorHit> = best
            .into_iter()
            .map(|(id, score)| VectorHit { id, score })
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

    /// Idempotent removal from the primary index and every loaded sub-index.
    /// Ids lingering in not-yet-loaded snapshots are dropped at hydration
    /// time, keeping I6 eventually enforced.
    pub fn delete_everywhere(&self, ids: &[Uuid]) -> Result<()> {
        self.primary().delete(ids)?;
        for entry in self.characters.iter() {
            entry.value().delete(ids)?;
        }
        Ok(())
    }

    /// Primary-index stats; sub-index totals are folded into `total`.
    pub fn stats(&self) -> IndexStats {
        let mut stats = self.primary().stats();
        for entry in self.characters.iter() {
            stats.total += entry.value().stats().total;
        }
        stats
    }

    /// Save the primary index and every loaded sub-index together.
    pub fn save_all(&self) -> Result<()> {
        self.primary().save(&self.index_file("primary"))?;
        for entry in self.characters.iter() {
            entry.value().save(&self.index_file(entry.key()))?;
        }
        Ok(())
    }

    /// Compare the index dimension against the provider's native dimension,
    /// probed with no truncation parameter.
    pub async fn detect_dimension_mismatch(
        &self,
        provider: &dyn EmbeddingProvider,
    ) -> Result<DimensionReport> {
        let native = with_retry(&self.retry, || provider.native_dimension()).await?;
        let index_dim = self.dimension();
        Ok(DimensionReport {
            mismatched: native != index_dim,
            index_dim,
            config_dim: native,
            model_id: provider.model_id(),
        })
    }

    fn report(progress: Option<ProgressCallback<'_>>, update: RebuildProgress) {
        tracing::debug!(
            phase = ?update.phase,
            current = update.current,
            total = update.total,
            "{}",
            update.message
        );
        if let Some(cb) = progress {
            cb(update);
        }
    }

    /// Full rebuild: probe the provider's true dimension, drop every index
    /// file, re-instantiate at the new dimension, then re-embed the whole
    /// store in batches, writing each fresh vector back to its chunk row
    /// and into the new index.
    pub async fn rebuild_all(
        &self,
        provider: &dyn EmbeddingProvider,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RebuildSummary> {
        let dimension = with_retry(&self.retry, || provider.native_dimension()).await?;
        if dimension == 0 {
            return Err(EngineError::index("provider reported zero dimension"));
        }

        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Deleting,
                current: 0,
                total: 0,
                message: "Removing old index files".into(),
            },
        );
        for entry in std::fs::read_dir(&self.indices_dir)? {
            let entry = entry?;
            std::fs::remove_file(entry.path()).ok();
        }
        self.characters.clear();
        *self.dimension.write() = dimension;
        *self.primary.write() = Self::make_index(self.kind, dimension)?;

        self.store.kv_set(KV_DIMENSION, &dimension.to_string())?;
        self.store.kv_set(KV_MODEL, &provider.model_id())?;

        let summary = self
            .reembed_scope(provider, &MemoryFilter::default(), dimension, progress)
            .await?;

        self.save_all()?;
        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Complete,
                current: summary.embedded,
                total: summary.scanned,
                message: format!("Rebuild complete at dimension {}", dimension),
            },
        );
        Ok(summary)
    }

    /// Rebuild one character's sub-index in place. The provider's dimension
    /// must match the current index dimension; cross-dimension repair goes
    /// through `rebuild_all`.
    pub async fn rebuild_single_character(
        &self,
        provider: &dyn EmbeddingProvider,
        character: &str,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RebuildSummary> {
        let dimension = self.checked_dimension(provider).await?;

        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Deleting,
                current: 0,
                total: 0,
                message: format!("Resetting sub-index for {}", character),
            },
        );
        std::fs::remove_file(self.index_file(character)).ok();
        self.characters
            .insert(character.to_string(), Self::make_index(self.kind, dimension)?);

        let filter = MemoryFilter {
            character_name: Some(character.to_string()),
            ..MemoryFilter::default()
        };
        let summary = self
            .reembed_scope(provider, &filter, dimension, progress)
            .await?;
        self.save_all()?;
        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Complete,
                current: summary.embedded,
                total: summary.scanned,
                message: format!("Sub-index rebuilt for {}", character),
            },
        );
        Ok(summary)
    }

    /// Rebuild every diary chunk (all characters' diaries plus unscoped).
    pub async fn rebuild_single_diary(
        &self,
        provider: &dyn EmbeddingProvider,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RebuildSummary> {
        let dimension = self.checked_dimension(provider).await?;
        let filter = MemoryFilter::for_source(MemorySource::Diary);

        let diary_ids: Vec<Uuid> = self
            .store
            .list(&filter, 1_000_000, 0)?
            .iter()
            .map(|c| c.id)
            .collect();
        self.delete_everywhere(&diary_ids)?;

        let summary = self
            .reembed_scope(provider, &filter, dimension, progress)
            .await?;
        self.save_all()?;
        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Complete,
                current: summary.embedded,
                total: summary.scanned,
                message: "Diary vectors rebuilt".into(),
            },
        );
        Ok(summary)
    }

    async fn checked_dimension(&self, provider: &dyn EmbeddingProvider) -> Result<usize> {
        let native = with_retry(&self.retry, || provider.native_dimension()).await?;
        let current = self.dimension();
        if native != current {
            return Err(EngineError::index(format!(
                "provider dimension {} != index dimension {}; run a full rebuild",
                native, current
            )));
        }
        Ok(current)
    }

    async fn reembed_scope(
        &self,
        provider: &dyn EmbeddingProvider,
        filter: &MemoryFilter,
        dimension: usize,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RebuildSummary> {
        let total = self.store.count(filter)?;
        Self::report(
            progress,
            RebuildProgress {
                phase: RebuildPhase::Reading,
                current: 0,
                total,
                message: format!("Scanning {} chunks", total),
            },
        );

        let mut summary = RebuildSummary {
            dimension,
            ..RebuildSummary::default()
        };
        let mut offset = 0usize;
        loop {
            let batch = self.store.list(filter, REBUILD_BATCH, offset)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            summary.scanned += batch.len();

            Self::report(
                progress,
                RebuildProgress {
                    phase: RebuildPhase::Embedding,
                    current: summary.scanned,
                    total,
                    message: format!("Embedding batch of {}", batch.len()),
                },
            );
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = with_retry(&self.retry, || provider.embed_documents(&texts)).await?;
            if vectors.len() != batch.len() {
                return Err(EngineError::index(format!(
                    "provider returned {} vectors for {} documents",
                    vectors.len(),
                    batch.len()
                )));
            }

            Self::report(
                progress,
                RebuildProgress {
                    phase: RebuildPhase::Inserting,
                    current: summary.scanned,
                    total,
                    message: "Writing vectors".into(),
                },
            );
            for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
                if vector.len() != dimension {
                    return Err(EngineError::index(format!(
                        "provider returned length {} during rebuild at dimension {}",
                        vector.len(),
                        dimension
                    )));
                }
                self.store.set_embedding(chunk.id, &vector)?;
                let character = chunk.owner.character_name.as_deref();
                self.insert_scoped(character, &[chunk.id], &[vector])?;
                summary.embedded += 1;
            }
        }
        Ok(summary)
    }

    /// Re-insert vectors already present in the store into fresh indices.
    /// No re-embedding happens; rows without an embedding are skipped.
    pub fn recover_from_backing_store(&self, filter: Option<&MemoryFilter>) -> Result<usize> {
        let all = MemoryFilter::default();
        let filter = filter.unwrap_or(&all);
        let dimension = self.dimension();

        let mut recovered = 0usize;
        let mut offset = 0usize;
        loop {
            let batch = self.store.list_embedded(filter, 100, offset)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            for (id, vector) in batch {
                if vector.len() != dimension {
                    tracing::warn!(
                        chunk_id = %id,
                        stored = vector.len(),
                        expected = dimension,
                        "Skipping stored vector with stale dimension"
                    );
                    continue;
                }
                let character = self
                    .store
                    .get(id)?
                    .and_then(|c| c.owner.character_name);
                self.insert_scoped(character.as_deref(), &[id], &[vector])?;
                recovered += 1;
            }
        }
        tracing::info!(recovered, "Recovered vectors from backing store");
        Ok(recovered)
    }

    /// Cross-check index totals against rows holding embeddings.
    pub fn validate_health(&self) -> Result<HealthReport> {
        let mut issues = Vec::new();
        let stats = self.stats();
        if stats.dimension == 0 {
            issues.push("index dimension is zero".to_string());
        }
        let embedded = self.store.count_embedded(&MemoryFilter::default())?;
        if stats.total != embedded {
            issues.push(format!(
                "index holds {} vectors but {} chunk rows have embeddings",
                stats.total, embedded
            ));
        }
        Ok(HealthReport {
            healthy: issues.is_empty(),
            issues,
        })
    }
}

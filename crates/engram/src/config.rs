use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::MemorySource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingSettings,
    pub search: SearchSettings,
    pub cache: CacheSettings,
    pub learning: LearningSettings,
    pub index: IndexSettings,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Configured vector dimension. The provider's native dimension may
    /// disagree; IndexManager detects and repairs the drift.
    pub dimension: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    pub default_top_k: usize,
    /// Vector candidates fetched per request = top_k * this multiplier.
    pub candidate_multiplier: usize,
    pub default_threshold: f32,
    pub rrf_k: usize,
    /// Raised fuser constant for deep_search, favoring cross-backend agreement.
    pub deep_rrf_k: usize,
    pub vector_weight: f32,
    pub bm25_weight: f32,
    /// Per-backend fusion weights; unlisted backends use `default_backend_weight`.
    pub backend_weights: HashMap<String, f32>,
    pub default_backend_weight: f32,
    /// Stronger threshold applied by the Focus phase of wave_rag_search.
    pub focus_score_threshold: f32,
    /// Vector-similarity threshold for semantic duplicate rejection on ingest.
    pub semantic_duplicate_threshold: f32,
    pub tag_boost: TagBoostSettings,
    pub rerank: RerankSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagBoostSettings {
    /// Exponent applied to the match weight.
    pub alpha: f32,
    /// Additive term inside the log frequency penalty.
    pub beta: f32,
    /// Multiplicative boost ceiling.
    pub max_factor: f32,
    /// Minimum normalized edge weight admitted during tag expansion.
    pub expansion_min_weight: f32,
    pub expansion_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankSettings {
    pub batch_size: usize,
    pub keep_per_batch: usize,
    pub max_depth: usize,
    /// Only the top N results enter the recursive re-rank; the tail is appended unchanged.
    pub max_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSettings {
    /// Weight delta per feedback signal.
    pub step: f32,
    /// Per-entry weight bound (applied symmetrically).
    pub weight_cap: f32,
    /// Total adjustment clamp applied at rerank time.
    pub adjustment_clamp: f32,
    /// Multiplicative decay per day of inactivity.
    pub decay_per_day: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Native usearch index when true; portable brute-force scan otherwise.
    pub native: bool,
    /// Ingest batches larger than this are split at the coordinator boundary.
    pub ingest_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_tag_boost: bool,
    pub enable_semantic_dedup: bool,
    pub enable_learning: bool,
    pub enable_auto_tag: bool,
}

/// Static description of one logical backend served by a retrieval pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    pub source: MemorySource,
    /// Routes searches through a per-character sub-index when true.
    pub character_scoped: bool,
}

impl EngineConfig {
    /// The default backend set: two conversational memory tiers, the diary,
    /// the knowledge base, and free-form notes.
    pub fn default_backends() -> Vec<BackendSpec> {
        vec![
            BackendSpec {
                name: "lightmemo".into(),
                source: MemorySource::Memory,
                character_scoped: false,
            },
            BackendSpec {
                name: "deepmemo".into(),
                source: MemorySource::Memory,
                character_scoped: true,
            },
            BackendSpec {
                name: "diary".into(),
                source: MemorySource::Diary,
                character_scoped: true,
            },
            BackendSpec {
                name: "knowledge".into(),
                source: MemorySource::Knowledge,
                character_scoped: false,
            },
            BackendSpec {
                name: "notes".into(),
                source: MemorySource::Memory,
                character_scoped: false,
            },
        ]
    }

    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.search.default_top_k == 0 {
            return Err("search.default_top_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.search.default_threshold) {
            return Err("search.default_threshold must be in [0.0, 1.0]".into());
        }
        let blend = self.search.vector_weight + self.search.bm25_weight;
        if (blend - 1.0).abs() > 1e-3 {
            return Err("search.vector_weight + search.bm25_weight must sum to 1.0".into());
        }
        if self.search.tag_boost.max_factor < 1.0 {
            return Err("search.tag_boost.max_factor must be >= 1.0".into());
        }
        if self.search.rerank.batch_size == 0 || self.search.rerank.keep_per_batch == 0 {
            return Err("search.rerank batch parameters must be > 0".into());
        }
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be > 0".into());
        }
        if self.index.ingest_batch_size == 0 {
            return Err("index.ingest_batch_size must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Weight applied to a backend's ranked list during fusion.
    pub fn backend_weight(&self, backend: &str) -> f32 {
        self.search
            .backend_weights
            .get(backend)
            .copied()
            .unwrap_or(self.search.default_backend_weight)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("engram");

        let mut backend_weights = HashMap::new();
        backend_weights.insert("lightmemo".to_string(), 0.5);
        backend_weights.insert("deepmemo".to_string(), 0.35);
        backend_weights.insert("diary".to_string(), 0.15);

        Self {
            data_dir,
            embedding: EmbeddingSettings {
                endpoint: "http://localhost:11434/v1/embeddings".into(),
                api_key: None,
                model: "nomic-embed-text".into(),
                dimension: 768,
                request_timeout_secs: 30,
            },
            search: SearchSettings {
                default_top_k: 10,
                candidate_multiplier: 2,
                default_threshold: 0.3,
                rrf_k: 60,
                deep_rrf_k: 120,
                vector_weight: 0.6,
                bm25_weight: 0.4,
                backend_weights,
                default_backend_weight: 0.3,
                focus_score_threshold: 0.55,
                semantic_duplicate_threshold: 0.85,
                tag_boost: TagBoostSettings {
                    alpha: 2.0,
                    beta: 2.0,
                    max_factor: 1.3,
                    expansion_min_weight: 0.7,
                    expansion_depth: 2,
                },
                rerank: RerankSettings {
                    batch_size: 5,
                    keep_per_batch: 2,
                    max_depth: 3,
                    max_items: 10,
                },
            },
            cache: CacheSettings {
                ttl_secs: 300,
                max_entries: 1000,
            },
            learning: LearningSettings {
                step: 0.1,
                weight_cap: 1.0,
                adjustment_clamp: 0.3,
                decay_per_day: 0.99,
            },
            index: IndexSettings {
                native: true,
                ingest_batch_size: 10,
            },
            features: FeatureFlags {
                enable_tag_boost: true,
                enable_semantic_dedup: true,
                enable_learning: true,
                enable_auto_tag: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_dimension() {
        let mut config = EngineConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_blend() {
        let mut config = EngineConfig::default();
        config.search.vector_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_weight_falls_back_to_default() {
        let config = EngineConfig::default();
        assert_eq!(config.backend_weight("lightmemo"), 0.5);
        assert_eq!(config.backend_weight("deepmemo"), 0.35);
        assert_eq!(config.backend_weight("diary"), 0.15);
        assert_eq!(config.backend_weight("notes"), 0.3);
    }
}

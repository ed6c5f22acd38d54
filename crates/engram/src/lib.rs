//! engram: long-term memory and retrieval engine for conversational agents.
//!
//! Ingests free-form text into a relational chunk store plus a dense-vector
//! index, and answers natural-language queries by fusing vector similarity,
//! BM25, tag-cooccurrence boosting, and learned feedback weights across
//! several logical backends.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod index;
pub mod learning;
pub mod providers;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use config::{BackendSpec, EngineConfig};
pub use coordinator::{
    CreateMemoryRequest, IntegratedStats, MemoryCoordinator, SearchOptions, UpdateMemoryRequest,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use index::manager::{DimensionReport, HealthReport, RebuildPhase, RebuildProgress};
pub use providers::{EmbeddingProvider, Extractor, ProviderError, Reranker, RetryPolicy};
pub use types::{
    Chunk, ChunkMetadata, MemoryFilter, MemorySource, Owner, ResultEnvelope, ScoredMemory,
};

// Re-export common external types
pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;

//! Engine assembly: one value owning the store, indices, tag graph,
//! coordinator, and caches. Built once at startup and threaded through
//! callers; each subsystem receives only the narrow handles it needs.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BackendSpec, EngineConfig};
use crate::coordinator::{
    CreateMemoryRequest, IntegratedStats, MemoryCoordinator, SearchOptions, UpdateMemoryRequest,
};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::graph::TagGraph;
use crate::index::manager::{
    DimensionReport, HealthReport, IndexKind, RebuildProgress, RebuildSummary,
};
use crate::index::IndexManager;
use crate::learning::LearningProgress;
use crate::providers::{
    EmbeddingProvider, Extractor, ExtractorGateway, HttpEmbeddingProvider, Reranker, RetryPolicy,
};
use crate::storage::ChunkStore;
use crate::types::{Chunk, MemoryFilter, ResultEnvelope, ScoredMemory};

const DB_FILE: &str = "engram.db";
const TAG_GRAPH_FILE: &str = "tag_graph.json";
const LEARNING_FILE: &str = "learning.json";

pub struct EngineBuilder {
    config: EngineConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    extractor: Option<Arc<dyn Extractor>>,
    reranker: Option<Arc<dyn Reranker>>,
    backends: Option<Vec<BackendSpec>>,
    retry: RetryPolicy,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            extractor: None,
            reranker: None,
            backends: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn backends(mut self, backends: Vec<BackendSpec>) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate().map_err(EngineError::Validation)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(ChunkStore::open(&config.data_dir.join(DB_FILE))?);

        let kind = if config.index.native {
            IndexKind::Native
        } else {
            IndexKind::Flat
        };
        let indexes = Arc::new(IndexManager::open(
            store.clone(),
            kind,
            &config.data_dir,
            config.embedding.dimension,
        )?);

        let tags = Self::open_tag_graph(&config.data_dir.join(TAG_GRAPH_FILE), &store)?;

        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(HttpEmbeddingProvider::new(&config.embedding)?),
        };
        let backends = self
            .backends
            .unwrap_or_else(EngineConfig::default_backends);

        let events = EventBus::default();
        let coordinator = MemoryCoordinator::new(
            config.clone(),
            backends,
            store.clone(),
            indexes.clone(),
            tags.clone(),
            provider.clone(),
            self.reranker,
            ExtractorGateway::new(self.extractor),
            events.clone(),
            self.retry,
        );

        let learning_path = config.data_dir.join(LEARNING_FILE);
        if learning_path.exists() {
            if let Err(err) = coordinator.learning().load(&learning_path) {
                tracing::warn!(error = %err, "Failed to load learning snapshot, starting fresh");
            }
        }

        Ok(Engine {
            config,
            store,
            indexes,
            tags,
            provider,
            coordinator,
            events,
        })
    }

    /// Restore the tag graph snapshot, or rebuild it from the chunk set;
    /// the graph is always derivable from storage.
    fn open_tag_graph(path: &std::path::Path, store: &ChunkStore) -> Result<Arc<TagGraph>> {
        if path.exists() {
            match TagGraph::load(path) {
                Ok(graph) => return Ok(Arc::new(graph)),
                Err(err) => {
                    tracing::warn!(error = %err, "Tag graph snapshot unreadable, rebuilding from chunks");
                }
            }
        }
        let graph = TagGraph::new();
        let mut offset = 0usize;
        loop {
            let batch = store.list(&MemoryFilter::default(), 500, offset)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            for chunk in &batch {
                if !chunk.metadata.tags.is_empty() {
                    graph.record_chunk(&chunk.metadata.tags);
                }
            }
        }
        Ok(Arc::new(graph))
    }
}

/// The long-term memory engine. All public entry points live here or on the
/// coordinator it owns.
pub struct Engine {
    config: EngineConfig,
    store: Arc<ChunkStore>,
    indexes: Arc<IndexManager>,
    tags: Arc<TagGraph>,
    provider: Arc<dyn EmbeddingProvider>,
    coordinator: MemoryCoordinator,
    events: EventBus,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Open with an explicit embedding provider.
    pub fn open(config: EngineConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        EngineBuilder::new(config).provider(provider).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    pub fn tags(&self) -> &Arc<TagGraph> {
        &self.tags
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // -- Search ------------------------------------------------------------

    pub async fn intelligent_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        self.coordinator
            .intelligent_search(query, options, cancel)
            .await
    }

    pub async fn deep_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        self.coordinator.deep_search(query, options, cancel).await
    }

    pub async fn wave_rag_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        self.coordinator
            .wave_rag_search(query, options, cancel)
            .await
    }

    // -- Write path --------------------------------------------------------

    pub async fn create_memory(
        &self,
        request: &CreateMemoryRequest,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Chunk> {
        self.coordinator.create_memory(request, cancel).await
    }

    pub async fn create_memories(
        &self,
        requests: &[CreateMemoryRequest],
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<Uuid>> {
        self.coordinator.create_memories(requests, cancel).await
    }

    pub async fn update_memory(
        &self,
        id: Uuid,
        request: &UpdateMemoryRequest,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Chunk> {
        self.coordinator.update_memory(id, request, cancel).await
    }

    pub async fn delete_memory(&self, id: Uuid) -> ResultEnvelope<bool> {
        self.coordinator.delete_memory(id).await
    }

    pub async fn delete_memories(&self, filter: &MemoryFilter) -> ResultEnvelope<Vec<Uuid>> {
        self.coordinator.delete_memories(filter).await
    }

    pub async fn forget_matching(
        &self,
        pattern: &str,
        filter: &MemoryFilter,
    ) -> ResultEnvelope<Vec<Uuid>> {
        self.coordinator.forget_matching(pattern, filter).await
    }

    pub fn list_memories(
        &self,
        filter: &MemoryFilter,
        limit: usize,
        offset: usize,
    ) -> ResultEnvelope<Vec<Chunk>> {
        self.coordinator.list_memories(filter, limit, offset)
    }

    // -- Feedback ----------------------------------------------------------

    pub fn record_positive_feedback(&self, query: &str, selected_id: Uuid) {
        self.coordinator.record_positive_feedback(query, selected_id);
    }

    pub fn record_negative_feedback(&self, query: &str, avoided_id: Uuid) {
        self.coordinator.record_negative_feedback(query, avoided_id);
    }

    pub fn get_learning_progress(&self) -> LearningProgress {
        self.coordinator.get_learning_progress()
    }

    pub fn get_integrated_stats(&self) -> Result<IntegratedStats> {
        self.coordinator.get_integrated_stats()
    }

    // -- Maintenance -------------------------------------------------------

    /// Compare the live index dimension against the provider's native one.
    pub async fn detect_dimension_mismatch(&self) -> Result<DimensionReport> {
        self.indexes
            .detect_dimension_mismatch(self.provider.as_ref())
            .await
    }

    /// Full re-embed of every chunk. Progress is broadcast as
    /// `RebuildProgress` events.
    pub async fn rebuild_all(&self) -> Result<RebuildSummary> {
        let events = self.events.clone();
        let cb = move |progress: RebuildProgress| {
            events.emit(EngineEvent::RebuildProgress(progress));
        };
        let cb: &(dyn Fn(RebuildProgress) + Send + Sync) = &cb;
        self.indexes
            .rebuild_all(self.provider.as_ref(), Some(cb))
            .await
    }

    pub async fn rebuild_single_character(&self, character: &str) -> Result<RebuildSummary> {
        let events = self.events.clone();
        let cb = move |progress: RebuildProgress| {
            events.emit(EngineEvent::RebuildProgress(progress));
        };
        let cb: &(dyn Fn(RebuildProgress) + Send + Sync) = &cb;
        self.indexes
            .rebuild_single_character(self.provider.as_ref(), character, Some(cb))
            .await
    }

    pub async fn rebuild_single_diary(&self) -> Result<RebuildSummary> {
        let events = self.events.clone();
        let cb = move |progress: RebuildProgress| {
            events.emit(EngineEvent::RebuildProgress(progress));
        };
        let cb: &(dyn Fn(RebuildProgress) + Send + Sync) = &cb;
        self.indexes
            .rebuild_single_diary(self.provider.as_ref(), Some(cb))
            .await
    }

    pub fn recover_from_backing_store(&self, filter: Option<&MemoryFilter>) -> Result<usize> {
        self.indexes.recover_from_backing_store(filter)
    }

    pub fn validate_health(&self) -> Result<HealthReport> {
        self.indexes.validate_health()
    }

    /// Persist every snapshot: vector indices, tag graph, learning weights.
    pub fn save(&self) -> Result<()> {
        self.indexes.save_all()?;
        self.tags.save(&self.config.data_dir.join(TAG_GRAPH_FILE))?;
        self.coordinator
            .learning()
            .save(&self.config.data_dir.join(LEARNING_FILE))?;
        Ok(())
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::MockEmbeddingProvider;
    use crate::types::content_hash;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.data_dir = dir.to_path_buf();
        config.embedding.dimension = 32;
        config.index.native = false;
        config
    }

    fn open_engine(dir: &std::path::Path) -> (Engine, Arc<MockEmbeddingProvider>) {
        let provider = Arc::new(MockEmbeddingProvider::new(32));
        let engine = Engine::open(test_config(dir), provider.clone()).unwrap();
        (engine, provider)
    }

    #[tokio::test]
    async fn insert_then_search_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, provider) = open_engine(dir.path());
        let cancel = CancellationToken::new();

        let request = CreateMemoryRequest::new("the sky is blue today", "lightmemo");
        let created = engine.create_memory(&request, &cancel).await;
        assert!(created.success);
        let chunk = created.data.unwrap();

        // Stored row is findable by hash and its vector finds itself.
        let found = engine
            .store()
            .find_by_hash(&content_hash("the sky is blue today"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, chunk.id);

        let vector = provider.embed("the sky is blue today");
        let hits = engine.indexes().search_scoped(None, &vector, 1).unwrap();
        assert_eq!(hits[0].id, chunk.id);
        assert!(hits[0].score >= 0.999);
    }

    #[tokio::test]
    async fn snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let id;
        {
            let (engine, _provider) = open_engine(dir.path());
            let mut request = CreateMemoryRequest::new("persistent entry", "lightmemo");
            request.tags = vec!["durable".into()];
            id = engine
                .create_memory(&request, &cancel)
                .await
                .data
                .unwrap()
                .id;
            engine.record_positive_feedback("persistent entry", id);
            engine.save().unwrap();
        }

        let (engine, _provider) = open_engine(dir.path());
        assert_eq!(engine.tags().frequency("durable"), 1);
        assert!(engine.get_learning_progress().positive_signals > 0);
        // The index snapshot reloaded with its contents.
        assert_eq!(engine.indexes().stats().total, 1);
        assert!(engine.validate_health().unwrap().healthy);
        let _ = id;
    }

    #[tokio::test]
    async fn rebuild_emits_progress_events() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, provider) = open_engine(dir.path());
        let cancel = CancellationToken::new();
        engine
            .create_memory(&CreateMemoryRequest::new("entry one", "lightmemo"), &cancel)
            .await;
        let mut events = engine.subscribe();

        provider.set_dimension(16);
        let summary = engine.rebuild_all().await.unwrap();
        assert_eq!(summary.dimension, 16);
        assert_eq!(engine.indexes().stats().dimension, 16);

        let mut saw_progress = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::RebuildProgress(_)) {
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn dimension_drift_detection_and_insert_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, provider) = open_engine(dir.path());

        // Provider shrinks its vectors: inserts must fail, detection must fire.
        provider.set_dimension(16);
        let err = engine
            .indexes()
            .insert_scoped(None, &[Uuid::new_v4()], &[provider.embed("probe")])
            .unwrap_err();
        assert!(matches!(err, EngineError::IndexConsistency(_)));

        let report = engine.detect_dimension_mismatch().await.unwrap();
        assert!(report.mismatched);
        assert_eq!(report.index_dim, 32);
        assert_eq!(report.config_dim, 16);

        let summary = engine.rebuild_all().await.unwrap();
        assert_eq!(summary.dimension, 16);
        assert!(!engine.detect_dimension_mismatch().await.unwrap().mismatched);
    }

    #[tokio::test]
    async fn rebuild_preserves_top_results() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _provider) = open_engine(dir.path());
        let cancel = CancellationToken::new();
        for content in [
            "rust borrow checker notes",
            "gardening in late spring",
            "rust async runtime comparison",
        ] {
            engine
                .create_memory(&CreateMemoryRequest::new(content, "lightmemo"), &cancel)
                .await;
        }

        let options = SearchOptions {
            threshold: Some(0.0),
            ..SearchOptions::default()
        };
        let before: Vec<Uuid> = engine
            .intelligent_search("rust notes", &options, &cancel)
            .await
            .data
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();

        engine.rebuild_all().await.unwrap();

        let after: Vec<Uuid> = engine
            .intelligent_search("rust notes", &options, &cancel)
            .await
            .data
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();

        let before_set: std::collections::HashSet<Uuid> = before.into_iter().collect();
        let after_set: std::collections::HashSet<Uuid> = after.into_iter().collect();
        assert_eq!(before_set, after_set);
    }
}

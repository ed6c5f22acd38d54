//! Multi-backend coordination: fan-out retrieval, fusion, learning
//! reweighting, caching, and the write path (ingest, update, delete).
//!
//! Every public operation returns a [`ResultEnvelope`] and accepts a
//! cancellation token. Writes are ordered "store row first, then index
//! insert"; anything left dangling between the two is repaired the next
//! time a search hydrates candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheStats, ResultCache};
use crate::config::{BackendSpec, EngineConfig};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::graph::{TagGraph, TagGraphStats};
use crate::index::{IndexManager, IndexStats};
use crate::learning::{FeedbackSignal, LearningProgress, LearningStore};
use crate::providers::{
    with_retry, EmbeddingProvider, ExtractorGateway, ProviderError, Reranker, RetryPolicy,
};
use crate::retrieval::{RetrievalPipeline, SearchRequest};
use crate::search::{reciprocal_rank_fusion, tokenize, FusionOptions, RankedSource};
use crate::storage::{ChunkPatch, ChunkStore};
use crate::types::{
    content_hash, Chunk, ChunkMetadata, MemoryFilter, MemorySource, Owner, ResponseMeta,
    ResultEnvelope, ScoredMemory,
};

/// Options accepted by every search entry point. Hashed canonically for the
/// result cache, so every field participates in the cache key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    /// Backend subset; all configured backends when empty.
    pub backends: Option<Vec<String>>,
    pub threshold: Option<f32>,
    pub apply_learning: bool,
    pub filter: MemoryFilter,
    /// Scopes the knowledge backend to one ingested document group.
    pub knowledge_base_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CacheKey<'a> {
    mode: &'a str,
    query: &'a str,
    options: &'a SearchOptions,
}

#[derive(Debug, Clone)]
pub struct CreateMemoryRequest {
    pub content: String,
    pub backend: String,
    pub tags: Vec<String>,
    pub auto_tag: bool,
    pub metadata: ChunkMetadata,
    pub owner: Owner,
    pub loader_id: Option<String>,
}

impl CreateMemoryRequest {
    pub fn new(content: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            backend: backend.into(),
            tags: Vec::new(),
            auto_tag: false,
            metadata: ChunkMetadata::default(),
            owner: Owner::default(),
            loader_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMemoryRequest {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<u8>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegratedStats {
    pub total_chunks: usize,
    pub chunks_by_source: HashMap<String, usize>,
    pub index: IndexStats,
    pub tags: TagGraphStats,
    pub cache: CacheStats,
    pub learning: LearningProgress,
}

pub struct MemoryCoordinator {
    config: EngineConfig,
    backends: Vec<BackendSpec>,
    pipelines: HashMap<String, Arc<RetrievalPipeline>>,
    store: Arc<ChunkStore>,
    indexes: Arc<IndexManager>,
    tags: Arc<TagGraph>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: ResultCache,
    learning: LearningStore,
    extractor: ExtractorGateway,
    events: EventBus,
    retry: RetryPolicy,
}

impl MemoryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        backends: Vec<BackendSpec>,
        store: Arc<ChunkStore>,
        indexes: Arc<IndexManager>,
        tags: Arc<TagGraph>,
        provider: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn Reranker>>,
        extractor: ExtractorGateway,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        let mut pipelines = HashMap::new();
        for spec in &backends {
            let pipeline = RetrievalPipeline::new(
                spec.name.clone(),
                spec.source,
                spec.character_scoped,
                store.clone(),
                indexes.clone(),
                tags.clone(),
                provider.clone(),
                reranker.clone(),
                config.search.clone(),
                retry,
            );
            pipelines.insert(spec.name.clone(), Arc::new(pipeline));
        }

        Self {
            cache: ResultCache::new(&config.cache),
            learning: LearningStore::new(config.learning.clone()),
            config,
            backends,
            pipelines,
            store,
            indexes,
            tags,
            provider,
            extractor,
            events,
            retry,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn learning(&self) -> &LearningStore {
        &self.learning
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn extractor(&self) -> &ExtractorGateway {
        &self.extractor
    }

    fn backend_names(&self, options: &SearchOptions) -> Vec<String> {
        match &options.backends {
            Some(names) if !names.is_empty() => names.clone(),
            _ => self.backends.iter().map(|b| b.name.clone()).collect(),
        }
    }

    fn backend_spec(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Fan out one query across the selected backends and collect their
    /// ranked lists in a deterministic order.
    async fn run_backends(
        &self,
        query: &str,
        options: &SearchOptions,
        deep_mode: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RankedSource>, bool)> {
        let top_k = options.top_k.unwrap_or(self.config.search.default_top_k);
        let threshold = options
            .threshold
            .unwrap_or(self.config.search.default_threshold);

        let mut futures = Vec::new();
        for name in self.backend_names(options) {
            let Some(pipeline) = self.pipelines.get(&name) else {
                tracing::warn!(backend = %name, "Unknown backend requested, skipping");
                continue;
            };
            let mut filter = options.filter.clone();
            if name == "knowledge" {
                if let Some(ref kb_id) = options.knowledge_base_id {
                    filter.loader_id = Some(kb_id.clone());
                }
            }
            let request = SearchRequest {
                query: query.to_string(),
                top_k,
                threshold,
                tag_boost_enabled: self.config.features.enable_tag_boost,
                deep_mode,
                filter,
            };
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            futures.push(async move {
                let outcome = pipeline.retrieve(&request, &cancel).await;
                (name, outcome)
            });
        }

        let mut sources = Vec::new();
        let mut degraded = false;
        for (name, outcome) in join_all(futures).await {
            match outcome {
                Ok(outcome) => {
                    degraded |= outcome.degraded;
                    sources.push(RankedSource {
                        weight: self.config.backend_weight(&name),
                        name,
                        items: outcome.items,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok((sources, degraded))
    }

    fn fuse(&self, sources: Vec<RankedSource>, rrf_k: usize) -> Vec<ScoredMemory> {
        reciprocal_rank_fusion(
            sources,
            &FusionOptions {
                k: rrf_k,
                normalize: true,
                min_score: None,
                max_results: None,
                fingerprint_dedup: true,
            },
        )
    }

    async fn search_internal(
        &self,
        mode: &'static str,
        query: &str,
        options: &SearchOptions,
        deep_mode: bool,
        rrf_k: usize,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();

        if query.trim().is_empty() {
            return ResultEnvelope::err("query must not be empty", meta);
        }

        let key = ResultCache::key_for(&CacheKey {
            mode,
            query,
            options,
        });
        if let Some(cached) = self.cache.get(&key) {
            meta.cache_hit = true;
            meta.elapsed_ms = started.elapsed().as_millis() as u64;
            return ResultEnvelope::ok(cached, meta);
        }

        let (sources, degraded) = match self.run_backends(query, options, deep_mode, cancel).await
        {
            Ok(result) => result,
            Err(err) => {
                meta.elapsed_ms = started.elapsed().as_millis() as u64;
                return ResultEnvelope::err(err.to_string(), meta);
            }
        };
        meta.backends = sources.iter().map(|s| s.name.clone()).collect();
        meta.degraded = degraded;

        // Fusion, then learning reweight, then threshold and top-k.
        let mut fused = self.fuse(sources, rrf_k);
        if options.apply_learning && self.config.features.enable_learning {
            let clamp = self.config.learning.adjustment_clamp;
            let tokens = tokenize(query);
            for item in fused.iter_mut() {
                let adjustment = self
                    .learning
                    .adjustment(&tokens, item.id)
                    .clamp(-clamp, clamp);
                if adjustment != 0.0 {
                    item.score = (item.score * (1.0 + adjustment)).clamp(0.0, 1.0);
                }
            }
            fused.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        let top_k = options.top_k.unwrap_or(self.config.search.default_top_k);
        let threshold = options
            .threshold
            .unwrap_or(self.config.search.default_threshold);
        fused.retain(|item| item.score >= threshold);
        fused.truncate(top_k);

        self.cache.insert(key, fused.clone());
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        self.events.emit(EngineEvent::RetrievalCompleted {
            query: query.to_string(),
            backends: meta.backends.len(),
            results: fused.len(),
            elapsed_ms: meta.elapsed_ms,
        });
        ResultEnvelope::ok(fused, meta)
    }

    /// Cache-checked fan-out search with RRF fusion and optional learning
    /// reweighting.
    pub async fn intelligent_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        self.search_internal(
            "intelligent",
            query,
            options,
            false,
            self.config.search.rrf_k,
            cancel,
        )
        .await
    }

    /// Deep variant: every pipeline runs in deep mode and the fuser's k is
    /// raised so cross-backend agreement dominates single-backend rank.
    pub async fn deep_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        self.search_internal(
            "deep",
            query,
            options,
            true,
            self.config.search.deep_rrf_k,
            cancel,
        )
        .await
    }

    /// Three-phase WaveRAG search. Lens: expand query tags through the
    /// cooccurrence graph. Expansion: rerun retrieval keeping chunks that
    /// carry any expanded tag. Focus: apply the stronger focus threshold.
    pub async fn wave_rag_search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<ScoredMemory>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();

        if query.trim().is_empty() {
            return ResultEnvelope::err("query must not be empty", meta);
        }

        let key = ResultCache::key_for(&CacheKey {
            mode: "wave",
            query,
            options,
        });
        if let Some(cached) = self.cache.get(&key) {
            meta.cache_hit = true;
            meta.elapsed_ms = started.elapsed().as_millis() as u64;
            return ResultEnvelope::ok(cached, meta);
        }

        // Lens phase: query tokens that are known tags seed the expansion.
        let seeds: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| self.tags.info(t).is_some())
            .collect();
        let expanded = self.tags.expand(
            &seeds,
            self.config.search.tag_boost.expansion_depth,
            self.config.search.tag_boost.expansion_min_weight,
        );
        tracing::debug!(query = %query, seeds = ?seeds, expanded = ?expanded, "WaveRAG lens");

        // Expansion phase: fan out, then keep chunks carrying an expanded tag.
        let (sources, degraded) = match self.run_backends(query, options, false, cancel).await {
            Ok(result) => result,
            Err(err) => {
                meta.elapsed_ms = started.elapsed().as_millis() as u64;
                return ResultEnvelope::err(err.to_string(), meta);
            }
        };
        meta.backends = sources.iter().map(|s| s.name.clone()).collect();
        meta.degraded = degraded;

        let mut fused = reciprocal_rank_fusion(
            sources,
            &FusionOptions {
                k: self.config.search.rrf_k,
                normalize: true,
                min_score: None,
                max_results: None,
                fingerprint_dedup: true,
            },
        );
        if !expanded.is_empty() {
            fused.retain(|item| item.tags.iter().any(|t| expanded.contains(t)));
        }

        // Focus phase.
        let top_k = options.top_k.unwrap_or(self.config.search.default_top_k);
        fused.retain(|item| item.score >= self.config.search.focus_score_threshold);
        fused.truncate(top_k);

        self.cache.insert(key, fused.clone());
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        self.events.emit(EngineEvent::RetrievalCompleted {
            query: query.to_string(),
            backends: meta.backends.len(),
            results: fused.len(),
            elapsed_ms: meta.elapsed_ms,
        });
        ResultEnvelope::ok(fused, meta)
    }

    fn source_for_backend(&self, backend: &str) -> Result<MemorySource> {
        self.backend_spec(backend)
            .map(|spec| spec.source)
            .ok_or_else(|| EngineError::validation(format!("unknown backend '{}'", backend)))
    }

    /// Ingest one memory: duplicate check, optional auto-tagging, embedding,
    /// store insert, index insert, tag-graph update, cache invalidation.
    pub async fn create_memory(
        &self,
        request: &CreateMemoryRequest,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Chunk> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = self.create_memory_inner(request, cancel).await;
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(chunk) => ResultEnvelope::ok(chunk, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    async fn create_memory_inner(
        &self,
        request: &CreateMemoryRequest,
        cancel: &CancellationToken,
    ) -> Result<Chunk> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(EngineError::validation("memory content must not be empty"));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let source = self.source_for_backend(&request.backend)?;

        // Exact duplicate check up front to skip the embedding round-trip.
        let hash = content_hash(content);
        if let Some(existing) = self.store.find_by_hash(&hash)? {
            if existing.source == source && existing.owner == request.owner {
                return Err(EngineError::Duplicate {
                    existing_id: existing.id,
                });
            }
        }

        let mut tags = request.tags.clone();
        if request.auto_tag && self.config.features.enable_auto_tag {
            let extraction = self
                .extractor
                .extract_best_effort(&[content.to_string()])
                .await;
            for memory in &extraction.memories {
                tags.extend(memory.tags.iter().cloned());
            }
            if !extraction.memories.is_empty() || !extraction.entities.is_empty() {
                self.events.emit(EngineEvent::ExtractionCompleted {
                    memories: extraction.memories.len(),
                    entities: extraction.entities.len(),
                    relations: extraction.relations.len(),
                });
            }
        }

        let embedding = match with_retry(&self.retry, || self.provider.embed_query(content)).await
        {
            Ok(vector) => Some(vector),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Embedding failed during ingest, storing without vector"
                );
                None
            }
        };

        // Cancellation after the embedding call but before the store insert
        // must leave nothing behind.
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.finalize_insert(request, source, content, tags, embedding)
    }

    fn finalize_insert(
        &self,
        request: &CreateMemoryRequest,
        source: MemorySource,
        content: &str,
        tags: Vec<String>,
        embedding: Option<Vec<f32>>,
    ) -> Result<Chunk> {
        // Semantic duplicate check against the nearest indexed neighbor.
        if self.config.features.enable_semantic_dedup {
            if let Some(ref vector) = embedding {
                if vector.len() == self.indexes.dimension() {
                    let scope = request.owner.character_name.as_deref();
                    if let Some(hit) = self.indexes.search_scoped(scope, vector, 1)?.first() {
                        if hit.score >= self.config.search.semantic_duplicate_threshold
                            && self.store.get(hit.id)?.is_some()
                        {
                            return Err(EngineError::Duplicate { existing_id: hit.id });
                        }
                    }
                }
            }
        }

        let mut chunk = Chunk::new(content, source);
        chunk.owner = request.owner.clone();
        chunk.loader_id = request.loader_id.clone();
        chunk.metadata = request.metadata.clone();
        chunk.metadata.tags = tags;
        chunk.metadata.normalize_tags();
        chunk.embedding = embedding.clone();

        // Store row first, then index insert; on index failure the row is
        // unwound so the write stays all-or-nothing.
        self.store.insert(&chunk)?;
        if let Some(vector) = embedding {
            let scope = chunk.owner.character_name.as_deref();
            if let Err(err) = self.indexes.insert_scoped(scope, &[chunk.id], &[vector]) {
                self.store.delete(chunk.id)?;
                return Err(err);
            }
        }

        self.tags.record_chunk(&chunk.metadata.tags);
        self.cache.clear();
        self.events.emit(EngineEvent::MemoryAdded {
            id: chunk.id,
            source: chunk.source,
        });
        tracing::info!(id = %chunk.id, source = %chunk.source, backend = %request.backend, "Memory created");
        Ok(chunk)
    }

    /// Batch ingest. Batches larger than the configured size are chunked at
    /// this boundary; a rate-limit signal from the provider pauses ingest
    /// for a back-off interval and emits a warning event.
    pub async fn create_memories(
        &self,
        requests: &[CreateMemoryRequest],
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Vec<Uuid>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let mut created = Vec::new();

        for group in requests.chunks(self.config.index.ingest_batch_size.max(1)) {
            if cancel.is_cancelled() {
                meta.elapsed_ms = started.elapsed().as_millis() as u64;
                return ResultEnvelope::err(EngineError::Cancelled.to_string(), meta);
            }

            let texts: Vec<String> = group.iter().map(|r| r.content.trim().to_string()).collect();
            let vectors = match with_retry(&self.retry, || self.provider.embed_documents(&texts))
                .await
            {
                Ok(vectors) => vectors.into_iter().map(Some).collect::<Vec<_>>(),
                Err(err @ ProviderError::RateLimited { .. }) => {
                    let pause = self.retry.base_backoff * 4;
                    self.events.emit(EngineEvent::Warning {
                        message: format!(
                            "Embedding provider rate limited, pausing ingest for {:?}",
                            pause
                        ),
                    });
                    tracing::warn!(error = %err, pause_ms = pause.as_millis() as u64, "Ingest paused by rate limit");
                    tokio::time::sleep(pause).await;
                    match with_retry(&self.retry, || self.provider.embed_documents(&texts)).await {
                        Ok(vectors) => vectors.into_iter().map(Some).collect(),
                        Err(err) => {
                            tracing::warn!(error = %err, "Batch embedding failed after pause, storing without vectors");
                            vec![None; group.len()]
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Batch embedding failed, storing without vectors");
                    vec![None; group.len()]
                }
            };

            for (request, vector) in group.iter().zip(vectors) {
                let content = request.content.trim().to_string();
                if content.is_empty() {
                    continue;
                }
                let source = match self.source_for_backend(&request.backend) {
                    Ok(source) => source,
                    Err(err) => {
                        tracing::warn!(backend = %request.backend, error = %err, "Skipping ingest item");
                        continue;
                    }
                };
                match self.finalize_insert(request, source, &content, request.tags.clone(), vector)
                {
                    Ok(chunk) => created.push(chunk.id),
                    Err(EngineError::Duplicate { existing_id }) => {
                        tracing::debug!(existing_id = %existing_id, "Skipping duplicate during batch ingest");
                    }
                    Err(err) => {
                        meta.elapsed_ms = started.elapsed().as_millis() as u64;
                        return ResultEnvelope::err(err.to_string(), meta);
                    }
                }
            }
        }

        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        ResultEnvelope::ok(created, meta)
    }

    /// Update a memory in place. A content change re-hashes and re-embeds;
    /// index, tag graph, and cache follow the row.
    pub async fn update_memory(
        &self,
        id: Uuid,
        request: &UpdateMemoryRequest,
        cancel: &CancellationToken,
    ) -> ResultEnvelope<Chunk> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = self.update_memory_inner(id, request, cancel).await;
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(chunk) => ResultEnvelope::ok(chunk, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    async fn update_memory_inner(
        &self,
        id: Uuid,
        request: &UpdateMemoryRequest,
        cancel: &CancellationToken,
    ) -> Result<Chunk> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let existing = self
            .store
            .get(id)?
            .ok_or_else(|| EngineError::validation(format!("unknown chunk id {}", id)))?;

        let mut patch = ChunkPatch::default();
        let mut new_vector: Option<Vec<f32>> = None;

        if let Some(ref content) = request.content {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Err(EngineError::validation("memory content must not be empty"));
            }
            if trimmed != existing.content {
                patch.content = Some(trimmed.to_string());
                patch.content_hash = Some(content_hash(trimmed));
                match with_retry(&self.retry, || self.provider.embed_query(trimmed)).await {
                    Ok(vector) => {
                        patch.embedding = Some(Some(vector.clone()));
                        new_vector = Some(vector);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Re-embedding failed during update, clearing vector");
                        patch.embedding = Some(None);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let tags_changed = request.tags.is_some();
        if request.tags.is_some() || request.importance.is_some() || request.confidence.is_some() {
            let mut metadata = existing.metadata.clone();
            if let Some(ref tags) = request.tags {
                metadata.tags = tags.clone();
            }
            if let Some(importance) = request.importance {
                metadata.importance = importance;
            }
            if let Some(confidence) = request.confidence {
                metadata.confidence = confidence;
            }
            metadata.normalize_tags();
            patch.metadata = Some(metadata);
        }

        let updated = self.store.update(id, patch)?;

        if let Some(vector) = new_vector {
            let scope = updated.owner.character_name.as_deref();
            self.indexes.delete_everywhere(&[id])?;
            self.indexes.insert_scoped(scope, &[id], &[vector])?;
        } else if request.content.is_some() && updated.embedding.is_none() {
            // Content changed but re-embedding failed: the stale vector must
            // not keep matching the old text.
            self.indexes.delete_everywhere(&[id])?;
        }

        if tags_changed {
            self.tags.remove_chunk(&existing.metadata.tags);
            self.tags.record_chunk(&updated.metadata.tags);
        }

        self.cache.clear();
        self.events.emit(EngineEvent::MemoryUpdated { id });
        Ok(updated)
    }

    pub async fn delete_memory(&self, id: Uuid) -> ResultEnvelope<bool> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = self.delete_memory_inner(id);
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(deleted) => ResultEnvelope::ok(deleted, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    fn delete_memory_inner(&self, id: Uuid) -> Result<bool> {
        let Some(existing) = self.store.get(id)? else {
            return Ok(false);
        };
        let deleted = self.store.delete(id)?;
        if deleted {
            self.indexes.delete_everywhere(&[id])?;
            self.tags.remove_chunk(&existing.metadata.tags);
            self.cache.clear();
            self.events.emit(EngineEvent::MemoryDeleted { ids: vec![id] });
        }
        Ok(deleted)
    }

    /// Bulk delete by filter; index, tag graph, and cache follow.
    pub async fn delete_memories(&self, filter: &MemoryFilter) -> ResultEnvelope<Vec<Uuid>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = (|| -> Result<Vec<Uuid>> {
            let victims = self.store.list(filter, 1_000_000, 0)?;
            let ids = self.store.delete_by_filter(filter)?;
            self.indexes.delete_everywhere(&ids)?;
            for chunk in &victims {
                self.tags.remove_chunk(&chunk.metadata.tags);
            }
            if !ids.is_empty() {
                self.cache.clear();
                self.events
                    .emit(EngineEvent::MemoryDeleted { ids: ids.clone() });
            }
            Ok(ids)
        })();
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(ids) => ResultEnvelope::ok(ids, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    /// Page through stored memories without scoring.
    pub fn list_memories(
        &self,
        filter: &MemoryFilter,
        limit: usize,
        offset: usize,
    ) -> ResultEnvelope<Vec<Chunk>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = self.store.list(filter, limit, offset);
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(chunks) => ResultEnvelope::ok(chunks, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    /// Forget every memory whose content matches a regular expression,
    /// optionally scoped by a filter.
    pub async fn forget_matching(
        &self,
        pattern: &str,
        filter: &MemoryFilter,
    ) -> ResultEnvelope<Vec<Uuid>> {
        let started = Instant::now();
        let mut meta = ResponseMeta::default();
        let result = (|| -> Result<Vec<Uuid>> {
            let re = regex::Regex::new(pattern)
                .map_err(|e| EngineError::validation(format!("invalid pattern: {}", e)))?;
            let victims: Vec<Chunk> = self
                .store
                .list(filter, 1_000_000, 0)?
                .into_iter()
                .filter(|c| re.is_match(&c.content))
                .collect();

            let mut ids = Vec::new();
            for chunk in &victims {
                if self.store.delete(chunk.id)? {
                    self.indexes.delete_everywhere(&[chunk.id])?;
                    self.tags.remove_chunk(&chunk.metadata.tags);
                    ids.push(chunk.id);
                }
            }
            if !ids.is_empty() {
                self.cache.clear();
                self.events
                    .emit(EngineEvent::MemoryDeleted { ids: ids.clone() });
            }
            Ok(ids)
        })();
        meta.elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(ids) => ResultEnvelope::ok(ids, meta),
            Err(err) => ResultEnvelope::err(err.to_string(), meta),
        }
    }

    /// The user kept this result: strengthen its tokens. Clears the cache so
    /// the next identical query reflects the new weights.
    pub fn record_positive_feedback(&self, query: &str, selected_id: Uuid) {
        for token in tokenize(query) {
            self.learning
                .record(&token, selected_id, FeedbackSignal::Positive);
        }
        self.cache.clear();
    }

    /// The user rejected this result: weaken its tokens.
    pub fn record_negative_feedback(&self, query: &str, avoided_id: Uuid) {
        for token in tokenize(query) {
            self.learning
                .record(&token, avoided_id, FeedbackSignal::Negative);
        }
        self.cache.clear();
    }

    pub fn get_learning_progress(&self) -> LearningProgress {
        self.learning.progress()
    }

    pub fn get_integrated_stats(&self) -> Result<IntegratedStats> {
        let mut chunks_by_source = HashMap::new();
        for source in [
            MemorySource::Knowledge,
            MemorySource::Memory,
            MemorySource::Diary,
        ] {
            chunks_by_source.insert(
                source.as_str().to_string(),
                self.store.count(&MemoryFilter::for_source(source))?,
            );
        }
        Ok(IntegratedStats {
            total_chunks: self.store.count(&MemoryFilter::default())?,
            chunks_by_source,
            index: self.indexes.stats(),
            tags: self.tags.stats(),
            cache: self.cache.stats(),
            learning: self.learning.progress(),
        })
    }
}

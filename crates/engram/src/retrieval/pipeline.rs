//! Single-backend retrieval: vector candidates, BM25 blend, tag boost,
//! optional deep re-rank.
//!
//! Every pipeline is bound to one backend: a source, an optional
//! per-character index scope, and the narrow handles it needs (store,
//! index manager, tag graph, embedding provider). Embedding failures
//! degrade to a text-only scan rather than failing the request.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SearchSettings;
use crate::error::{EngineError, Result};
use crate::graph::TagGraph;
use crate::index::IndexManager;
use crate::providers::{with_retry, EmbeddingProvider, Reranker, RetryPolicy};
use crate::search::{tokenize, Bm25Params, Bm25Scorer};
use crate::storage::ChunkStore;
use crate::types::{MemoryFilter, MemorySource, ScoredMemory};
use uuid::Uuid;

use super::rerank::recursive_rerank;

/// Per-call retrieval parameters.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub threshold: f32,
    pub tag_boost_enabled: bool,
    pub deep_mode: bool,
    pub filter: MemoryFilter,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub items: Vec<ScoredMemory>,
    /// True when the query embedding failed and results came from the
    /// text-only fallback.
    pub degraded: bool,
}

pub struct RetrievalPipeline {
    backend: String,
    source: MemorySource,
    character_scoped: bool,
    store: Arc<ChunkStore>,
    indexes: Arc<IndexManager>,
    tags: Arc<TagGraph>,
    provider: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    scorer: Bm25Scorer,
    settings: SearchSettings,
    retry: RetryPolicy,
}

impl RetrievalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: impl Into<String>,
        source: MemorySource,
        character_scoped: bool,
        store: Arc<ChunkStore>,
        indexes: Arc<IndexManager>,
        tags: Arc<TagGraph>,
        provider: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn Reranker>>,
        settings: SearchSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend: backend.into(),
            source,
            character_scoped,
            store,
            indexes,
            tags,
            provider,
            reranker,
            scorer: Bm25Scorer::new(Bm25Params::default()),
            settings,
            retry,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn source(&self) -> MemorySource {
        self.source
    }

    pub async fn retrieve(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome> {
        if request.query.trim().is_empty() {
            return Err(EngineError::validation("query must not be empty"));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let filter = self.effective_filter(&request.filter);

        let embedding = match with_retry(&self.retry, || {
            self.provider.embed_query(&request.query)
        })
        .await
        {
            Ok(vector) => Some(vector),
            Err(err) => {
                tracing::warn!(
                    backend = %self.backend,
                    error = %err,
                    "Query embedding failed, degrading to text search"
                );
                None
            }
        };
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let (mut items, degraded) = match embedding {
            Some(vector) => (self.vector_candidates(request, &filter, &vector)?, false),
            None => (self.text_fallback(request, &filter)?, true),
        };

        self.apply_bm25(&request.query, &mut items);

        if request.tag_boost_enabled && self.tags.has_cooccurrence_data() {
            self.apply_tag_boost(&request.query, &mut items);
        }

        if request.deep_mode && items.len() > 1 {
            items = self.deep_rerank(&request.query, items).await;
        }

        items.retain(|item| item.score >= request.threshold);
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        items.truncate(request.top_k);

        if degraded {
            for item in &mut items {
                item.degraded = true;
            }
        }

        tracing::debug!(
            backend = %self.backend,
            query = %request.query,
            results = items.len(),
            degraded,
            "Pipeline retrieval complete"
        );
        Ok(RetrievalOutcome { items, degraded })
    }

    /// Bind the caller's filter to this backend. A conflicting source field
    /// is a malformed filter: ignored with a warning, per the failure
    /// semantics of retrieval.
    fn effective_filter(&self, requested: &MemoryFilter) -> MemoryFilter {
        let mut filter = requested.clone();
        if let Some(source) = filter.source {
            if source != self.source {
                tracing::warn!(
                    backend = %self.backend,
                    requested = %source,
                    bound = %self.source,
                    "Ignoring filter source that conflicts with backend binding"
                );
            }
        }
        filter.source = Some(self.source);
        filter
    }

    /// Steps 2–4: oversampled ANN candidates, threshold and owner filters,
    /// hydration through the store. Vectors whose rows are gone are dropped
    /// from the index on the spot.
    fn vector_candidates(
        &self,
        request: &SearchRequest,
        filter: &MemoryFilter,
        query_vec: &[f32],
    ) -> Result<Vec<ScoredMemory>> {
        let oversample = request.top_k.max(1) * self.settings.candidate_multiplier.max(2);
        let character = if self.character_scoped {
            filter.character_name.as_deref()
        } else {
            None
        };

        let hits = self
            .indexes
            .search_scoped(character, query_vec, oversample)?;

        let mut items = Vec::with_capacity(hits.len());
        let mut dangling: Vec<Uuid> = Vec::new();
        for hit in hits {
            if hit.score < request.threshold {
                continue;
            }
            match self.store.get(hit.id)? {
                Some(chunk) => {
                    if filter.matches(&chunk) {
                        items.push(ScoredMemory::from_chunk(&chunk, hit.score, &self.backend));
                    }
                }
                None => dangling.push(hit.id),
            }
        }
        if !dangling.is_empty() {
            tracing::warn!(
                backend = %self.backend,
                count = dangling.len(),
                "Dropping index entries without chunk rows"
            );
            self.indexes.delete_everywhere(&dangling)?;
        }
        Ok(items)
    }

    /// Step 5: text-only fallback with the constant default score standing
    /// in for vector similarity.
    fn text_fallback(
        &self,
        request: &SearchRequest,
        filter: &MemoryFilter,
    ) -> Result<Vec<ScoredMemory>> {
        let limit = request.top_k.max(1) * self.settings.candidate_multiplier.max(2);
        let chunks = self.store.text_search(&request.query, filter, limit)?;
        Ok(chunks
            .iter()
            .map(|chunk| ScoredMemory::from_chunk(chunk, 0.5, &self.backend))
            .collect())
    }

    /// Step 6: blend vector similarity with batch-local BM25.
    fn apply_bm25(&self, query: &str, items: &mut [ScoredMemory]) {
        if items.is_empty() {
            return;
        }
        let docs: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        let scores = self.scorer.score_normalized(query, &docs);
        for (item, bm25) in items.iter_mut().zip(scores) {
            item.bm25_score = bm25;
            item.score = (self.settings.vector_weight * item.vec_score
                + self.settings.bm25_weight * bm25)
                .clamp(0.0, 1.0);
        }
    }

    /// Step 7: multiplicative tag boost from cooccurrence strength.
    ///
    /// Per matched chunk tag: `strength = w^alpha` with `w` 1.0 for a direct
    /// query-tag match and the strongest normalized graph link otherwise,
    /// `penalty = ln(df + beta)`. The summed `s` saturates via `s / (s + 4)`
    /// and scales the score by at most `max_factor`, capped at 1.0.
    fn apply_tag_boost(&self, query: &str, items: &mut [ScoredMemory]) {
        let query_tags = tokenize(query);
        if query_tags.is_empty() {
            return;
        }
        let boost = &self.settings.tag_boost;

        for item in items.iter_mut() {
            let mut s = 0.0f32;
            for tag in &item.tags {
                let w = if query_tags.iter().any(|q| q == tag) {
                    1.0
                } else {
                    query_tags
                        .iter()
                        .map(|q| self.tags.normalized_weight(tag, q))
                        .fold(0.0f32, f32::max)
                        .min(1.0)
                };
                if w <= 0.0 {
                    continue;
                }
                let strength = w.powf(boost.alpha);
                let df = self.tags.frequency(tag).max(1) as f32;
                let penalty = (df + boost.beta).ln();
                if penalty > 0.0 {
                    s += strength / penalty;
                }
            }
            if s > 0.0 {
                let norm = s / (s + 4.0);
                let factor = (1.0 + (boost.max_factor - 1.0) * norm).clamp(1.0, boost.max_factor);
                item.score = (item.score * factor).min(1.0);
            }
        }
    }

    /// Step 8: learned re-ranker over the head when configured, recursive
    /// bucket re-rank otherwise (also the fallback when the re-ranker fails).
    async fn deep_rerank(&self, query: &str, items: Vec<ScoredMemory>) -> Vec<ScoredMemory> {
        if let Some(reranker) = &self.reranker {
            let n = self.settings.rerank.max_items.min(items.len());
            match reranker.rerank(query, &items[..n], n).await {
                Ok(mut ranked) => {
                    ranked.extend(items[n..].iter().cloned());
                    return ranked;
                }
                Err(err) => {
                    tracing::warn!(
                        backend = %self.backend,
                        error = %err,
                        "Re-ranker failed, using recursive bucket re-rank"
                    );
                }
            }
        }
        recursive_rerank(query, items, &self.settings.rerank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::index::manager::IndexKind;
    use crate::providers::testing::MockEmbeddingProvider;
    use crate::types::Chunk;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChunkStore>,
        indexes: Arc<IndexManager>,
        tags: Arc<TagGraph>,
        provider: Arc<MockEmbeddingProvider>,
    }

    fn fixture(dimension: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::open_in_memory().unwrap());
        let indexes = Arc::new(
            IndexManager::open(store.clone(), IndexKind::Flat, dir.path(), dimension).unwrap(),
        );
        Fixture {
            _dir: dir,
            store,
            indexes,
            tags: Arc::new(TagGraph::new()),
            provider: Arc::new(MockEmbeddingProvider::new(dimension)),
        }
    }

    fn pipeline(f: &Fixture) -> RetrievalPipeline {
        RetrievalPipeline::new(
            "lightmemo",
            MemorySource::Memory,
            false,
            f.store.clone(),
            f.indexes.clone(),
            f.tags.clone(),
            f.provider.clone(),
            None,
            EngineConfig::default().search,
            RetryPolicy {
                max_retries: 1,
                base_backoff: Duration::from_millis(1),
            },
        )
    }

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            top_k: 10,
            threshold: 0.3,
            tag_boost_enabled: false,
            deep_mode: false,
            filter: MemoryFilter::default(),
        }
    }

    fn ingest(f: &Fixture, content: &str, tags: &[&str]) -> Uuid {
        let chunk = Chunk::new(content, MemorySource::Memory)
            .with_tags(tags.iter().map(|t| t.to_string()).collect());
        let vector = f.provider.embed(content);
        let mut stored = chunk.clone();
        stored.embedding = Some(vector.clone());
        let id = f.store.insert(&stored).unwrap();
        f.indexes.insert_scoped(None, &[id], &[vector]).unwrap();
        f.tags.record_chunk(&stored.metadata.tags);
        id
    }

    #[tokio::test]
    async fn hybrid_blend_orders_by_formula() {
        let f = fixture(4);
        // Fixed geometry: A is the better vector match, B the denser BM25 match.
        f.provider.set_response("cats", vec![1.0, 0.0, 0.0, 0.0]);
        f.provider
            .set_response("cats and dogs are pets", vec![0.95, 0.3122499, 0.0, 0.0]);
        f.provider.set_response("cats!", vec![0.5, 0.8660254, 0.0, 0.0]);

        let a = ingest(&f, "cats and dogs are pets", &[]);
        let b = ingest(&f, "cats!", &[]);

        let p = pipeline(&f);
        let outcome = p
            .retrieve(&request("cats"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.items.len(), 2);
        assert!(!outcome.degraded);

        let scorer = Bm25Scorer::default();
        let bm25 = scorer.score_normalized("cats", &["cats and dogs are pets", "cats!"]);
        let expected_a = 0.6 * 0.95 + 0.4 * bm25[0];
        let expected_b = 0.6 * 0.5 + 0.4 * bm25[1];

        assert_eq!(outcome.items[0].id, a);
        assert_eq!(outcome.items[1].id, b);
        assert!((outcome.items[0].score - expected_a).abs() < 1e-3);
        assert!((outcome.items[1].score - expected_b).abs() < 1e-3);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_text_search() {
        let f = fixture(8);
        ingest(&f, "the deploy pipeline is green", &[]);
        f.provider.set_fail(true);

        let p = pipeline(&f);
        let outcome = p
            .retrieve(&request("deploy pipeline"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.items.len(), 1);
        assert!(outcome.items[0].degraded);
        // Constant vector stand-in blended with BM25.
        assert!((outcome.items[0].vec_score - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn tag_boost_applies_saturated_factor() {
        let f = fixture(32);
        // Give the graph cooccurrence data so boosting activates.
        f.tags
            .record_chunk(&["work".to_string(), "deadline".to_string()]);

        let id = ingest(&f, "deadline for the quarterly report", &["work", "deadline"]);

        let p = pipeline(&f);
        let mut req = request("deadline");
        req.threshold = 0.0;
        let plain = p
            .retrieve(&req, &CancellationToken::new())
            .await
            .unwrap()
            .items;
        req.tag_boost_enabled = true;
        let boosted = p
            .retrieve(&req, &CancellationToken::new())
            .await
            .unwrap()
            .items;

        let plain_score = plain.iter().find(|i| i.id == id).unwrap().score;
        let boosted_score = boosted.iter().find(|i| i.id == id).unwrap().score;

        // Hand computation per the boost formula: direct match "deadline"
        // (w=1) plus cooccurring "work", each penalized by ln(df + 2).
        let w_work = f.tags.normalized_weight("work", "deadline").min(1.0);
        let df_deadline = f.tags.frequency("deadline").max(1) as f32;
        let df_work = f.tags.frequency("work").max(1) as f32;
        let mut s = 1.0f32 / (df_deadline + 2.0).ln();
        if w_work > 0.0 {
            s += w_work.powf(2.0) / (df_work + 2.0).ln();
        }
        let norm = s / (s + 4.0);
        let expected = (plain_score * (1.0 + 0.3 * norm)).min(1.0);
        assert!((boosted_score - expected).abs() < 1e-4);
        assert!(boosted_score > plain_score);
        assert!(boosted_score <= plain_score * 1.3 + 1e-6);
    }

    #[tokio::test]
    async fn filter_source_conflict_is_overridden() {
        let f = fixture(8);
        ingest(&f, "memory content here", &[]);

        let p = pipeline(&f);
        let mut req = request("memory content");
        // Malformed: asks a memory-bound backend for diary rows.
        req.filter.source = Some(MemorySource::Diary);
        let outcome = p.retrieve(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.items.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_propagates() {
        let f = fixture(8);
        let p = pipeline(&f);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p.retrieve(&request("anything"), &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn dangling_index_entries_are_repaired() {
        let f = fixture(8);
        let id = ingest(&f, "soon to vanish", &[]);
        // Row deleted, vector left behind.
        f.store.delete(id).unwrap();

        let p = pipeline(&f);
        let outcome = p
            .retrieve(&request("soon to vanish"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.items.is_empty());
        assert_eq!(f.indexes.stats().total, 0);
    }

    #[tokio::test]
    async fn deep_mode_keeps_result_set() {
        let f = fixture(8);
        for i in 0..6 {
            ingest(&f, &format!("note about topic number {}", i), &[]);
        }
        let p = pipeline(&f);
        let mut req = request("topic note");
        req.deep_mode = true;
        req.threshold = 0.0;
        let outcome = p.retrieve(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.items.len(), 6);
    }
}

//! Multi-source result fusion.
//!
//! Reciprocal Rank Fusion merges ranked lists without score normalization:
//! `score(d) = Σ w_i / (k + rank_i + 1)` over every source list containing
//! the document. A simpler weighted-average fuser blends one semantic and
//! one sparse list by alpha.

use std::collections::HashMap;

use crate::search::bm25::tokenize;
use crate::types::ScoredMemory;

/// One pre-ranked input list. Ties inside `items` are preserved by order.
#[derive(Debug, Clone)]
pub struct RankedSource {
    pub name: String,
    pub weight: f32,
    pub items: Vec<ScoredMemory>,
}

#[derive(Debug, Clone)]
pub struct FusionOptions {
    /// RRF rank constant. Raising it flattens rank differences and favors
    /// documents that appear in many sources.
    pub k: usize,
    /// Divide fused scores by the maximum, mapping them into [0, 1].
    pub normalize: bool,
    pub min_score: Option<f32>,
    pub max_results: Option<usize>,
    /// Drop near-identical content by bag-of-words fingerprint.
    pub fingerprint_dedup: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            k: 60,
            normalize: false,
            min_score: None,
            max_results: None,
            fingerprint_dedup: false,
        }
    }
}

/// Near-duplicate fingerprint: the first 20 significant tokens, sorted.
fn content_fingerprint(content: &str) -> String {
    let mut tokens: Vec<String> = tokenize(content)
        .into_iter()
        .filter(|t| t.chars().count() >= 3)
        .take(20)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens.join(" ")
}

struct Fused {
    score: f32,
    representative: ScoredMemory,
    /// Original score of the representative, used to pick the best copy.
    best_original: f32,
    first_seen: usize,
}

/// Weighted Reciprocal Rank Fusion over any number of sources.
///
/// Duplicate detection keys on [`ScoredMemory::dedup_key`]. When the same
/// document appears in several sources its representative is the copy with
/// the highest original score; fused contributions still sum across all
/// appearances. Output is ordered by fused score descending, ties broken by
/// key for determinism.
pub fn reciprocal_rank_fusion(
    sources: Vec<RankedSource>,
    opts: &FusionOptions,
) -> Vec<ScoredMemory> {
    let mut fused: HashMap<String, Fused> = HashMap::new();
    let mut order = 0usize;

    for source in sources {
        for (rank, item) in source.items.into_iter().enumerate() {
            let contribution = source.weight / (opts.k as f32 + rank as f32 + 1.0);
            let key = item.dedup_key();
            match fused.get_mut(&key) {
                Some(entry) => {
                    entry.score += contribution;
                    if item.score > entry.best_original {
                        entry.best_original = item.score;
                        entry.representative = item;
                    }
                }
                None => {
                    fused.insert(
                        key,
                        Fused {
                            score: contribution,
                            best_original: item.score,
                            representative: item,
                            first_seen: order,
                        },
                    );
                    order += 1;
                }
            }
        }
    }

    let mut merged: Vec<(String, Fused)> = fused.into_iter().collect();
    merged.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut results: Vec<ScoredMemory> = merged
        .into_iter()
        .map(|(_, f)| {
            let mut item = f.representative;
            item.score = f.score;
            item
        })
        .collect();

    if opts.normalize {
        if let Some(max) = results.first().map(|r| r.score) {
            if max > 0.0 {
                for item in &mut results {
                    item.score /= max;
                }
            }
        }
    }

    if let Some(min_score) = opts.min_score {
        results.retain(|r| r.score >= min_score);
    }

    if opts.fingerprint_dedup {
        let mut seen = std::collections::HashSet::new();
        results.retain(|r| seen.insert(content_fingerprint(&r.content)));
    }

    if let Some(max_results) = opts.max_results {
        results.truncate(max_results);
    }

    results
}

/// Alpha-blend of one semantic and one sparse list: same id contributes
/// `alpha * s_sem + (1 - alpha) * s_sparse`.
pub fn weighted_fusion(
    semantic: Vec<ScoredMemory>,
    sparse: Vec<ScoredMemory>,
    alpha: f32,
    top_k: usize,
) -> Vec<ScoredMemory> {
    let mut scores: HashMap<String, ScoredMemory> = HashMap::new();

    for item in semantic {
        let key = item.dedup_key();
        let mut weighted = item;
        weighted.score *= alpha;
        scores.insert(key, weighted);
    }

    for item in sparse {
        let key = item.dedup_key();
        let contribution = (1.0 - alpha) * item.score;
        scores
            .entry(key)
            .and_modify(|existing| existing.score += contribution)
            .or_insert_with(|| {
                let mut weighted = item;
                weighted.score = contribution;
                weighted
            });
    }

    let mut merged: Vec<ScoredMemory> = scores.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(top_k);
    merged
}

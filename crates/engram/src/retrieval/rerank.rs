//! Recursive bucket re-rank, used when no external re-ranker is configured.
//!
//! The top N results are split into small batches; a cheap lexical
//! relevance function keeps the best few per batch, and the survivors
//! recurse. Everything that was dropped or never entered the re-rank is
//! appended behind the winners, so no result is lost.

use crate::config::RerankSettings;
use crate::search::tokenize;
use crate::types::ScoredMemory;

/// Lexical relevance: query-term coverage (0.7) plus a log-scaled match
/// frequency (0.3).
pub fn lexical_relevance(query_terms: &[String], content: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(content);
    if tokens.is_empty() {
        return 0.0;
    }

    let covered = query_terms
        .iter()
        .filter(|term| tokens.iter().any(|t| t == *term))
        .count() as f32
        / query_terms.len() as f32;

    let matches = tokens
        .iter()
        .filter(|t| query_terms.iter().any(|term| term == *t))
        .count() as f32;
    let frequency = (1.0 + matches).ln() / (1.0 + tokens.len() as f32).ln();

    0.7 * covered + 0.3 * frequency
}

fn rerank_level(
    query_terms: &[String],
    items: Vec<ScoredMemory>,
    settings: &RerankSettings,
    depth: usize,
) -> Vec<ScoredMemory> {
    if depth >= settings.max_depth || items.len() <= settings.keep_per_batch {
        return items;
    }

    let mut survivors = Vec::new();
    let mut dropped = Vec::new();
    let mut batch = Vec::with_capacity(settings.batch_size);
    let mut pending = items.into_iter().peekable();

    while pending.peek().is_some() {
        batch.clear();
        while batch.len() < settings.batch_size {
            match pending.next() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch.sort_by(|a, b| {
            lexical_relevance(query_terms, &b.content)
                .partial_cmp(&lexical_relevance(query_terms, &a.content))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (i, item) in batch.drain(..).enumerate() {
            if i < settings.keep_per_batch {
                survivors.push(item);
            } else {
                dropped.push(item);
            }
        }
    }

    let mut ranked = rerank_level(query_terms, survivors, settings, depth + 1);
    ranked.extend(dropped);
    ranked
}

/// Re-rank the head of a result list (at most `settings.max_items` entries),
/// always appending the untouched tail.
pub fn recursive_rerank(
    query: &str,
    items: Vec<ScoredMemory>,
    settings: &RerankSettings,
) -> Vec<ScoredMemory> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() || items.len() < 2 {
        return items;
    }

    let head_len = settings.max_items.min(items.len());
    let mut iter = items.into_iter();
    let head: Vec<ScoredMemory> = iter.by_ref().take(head_len).collect();
    let tail: Vec<ScoredMemory> = iter.collect();

    let mut ranked = rerank_level(&query_terms, head, settings, 0);
    ranked.extend(tail);
    ranked
}

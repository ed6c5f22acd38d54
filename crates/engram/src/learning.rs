//! Per-(query-token, memory-id) feedback weights.
//!
//! Positive and negative signals nudge a sparse weight table that later
//! rescales ranker output. Entries are mutated atomically through the
//! dashmap entry API; persistence is a periodic JSON snapshot, so a crash
//! loses at most one interval.

use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LearningSettings;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackSignal {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearningEntry {
    weight: f32,
    positive: u32,
    negative: u32,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    token: String,
    memory_id: Uuid,
    #[serde(flatten)]
    entry: LearningEntry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningProgress {
    pub entries: usize,
    pub positive_signals: u64,
    pub negative_signals: u64,
    pub strongest_weight: f32,
    pub weakest_weight: f32,
}

pub struct LearningStore {
    weights: DashMap<(String, Uuid), LearningEntry>,
    settings: LearningSettings,
}

impl LearningStore {
    pub fn new(settings: LearningSettings) -> Self {
        Self {
            weights: DashMap::new(),
            settings,
        }
    }

    /// Apply one feedback signal to a `(token, memory)` pair.
    pub fn record(&self, token: &str, memory_id: Uuid, signal: FeedbackSignal) {
        let step = self.settings.step;
        let cap = self.settings.weight_cap;
        let mut entry = self
            .weights
            .entry((token.to_string(), memory_id))
            .or_insert_with(|| LearningEntry {
                weight: 0.0,
                positive: 0,
                negative: 0,
                updated_at: Utc::now(),
            });
        match signal {
            FeedbackSignal::Positive => {
                entry.weight = (entry.weight + step).min(cap);
                entry.positive += 1;
            }
            FeedbackSignal::Negative => {
                entry.weight = (entry.weight - step).max(-cap);
                entry.negative += 1;
            }
        }
        entry.updated_at = Utc::now();
    }

    /// Weight for one pair; missing entries contribute 0.
    pub fn weight(&self, token: &str, memory_id: Uuid) -> f32 {
        self.weights
            .get(&(token.to_string(), memory_id))
            .map(|e| e.weight)
            .unwrap_or(0.0)
    }

    /// Raw adjustment for a candidate: the sum over all query tokens.
    /// Callers clamp to the configured bound before applying.
    pub fn adjustment(&self, tokens: &[String], memory_id: Uuid) -> f32 {
        tokens
            .iter()
            .map(|token| self.weight(token, memory_id))
            .sum()
    }

    /// Multiplicative decay for entries untouched since `now`: weight is
    /// scaled by `decay_per_day^days_inactive`. Entries that decay to ~0 are
    /// dropped.
    pub fn decay(&self, now: DateTime<Utc>) {
        let per_day = self.settings.decay_per_day;
        self.weights.retain(|_, entry| {
            let days = (now - entry.updated_at).num_days();
            if days > 0 {
                entry.weight *= per_day.powi(days as i32);
            }
            entry.weight.abs() >= 1e-4
        });
    }

    pub fn progress(&self) -> LearningProgress {
        let mut progress = LearningProgress {
            entries: self.weights.len(),
            ..LearningProgress::default()
        };
        for entry in self.weights.iter() {
            progress.positive_signals += entry.positive as u64;
            progress.negative_signals += entry.negative as u64;
            progress.strongest_weight = progress.strongest_weight.max(entry.weight);
            progress.weakest_weight = progress.weakest_weight.min(entry.weight);
        }
        progress
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let records: Vec<SnapshotRecord> = self
            .weights
            .iter()
            .map(|kv| SnapshotRecord {
                token: kv.key().0.clone(),
                memory_id: kv.key().1,
                entry: kv.value().clone(),
            })
            .collect();
        let json = serde_json::to_vec(&records)
            .map_err(|e| EngineError::Validation(format!("learning snapshot serialize: {}", e)))?;
        crate::index::atomic_write(path, &json)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let json = std::fs::read(path)?;
        let records: Vec<SnapshotRecord> = serde_json::from_slice(&json)
            .map_err(|e| EngineError::Validation(format!("learning snapshot parse: {}", e)))?;
        self.weights.clear();
        for record in records {
            self.weights
                .insert((record.token, record.memory_id), record.entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn store() -> LearningStore {
        LearningStore::new(EngineConfig::default().learning)
    }

    #[test]
    fn positive_feedback_accumulates_and_caps() {
        let store = store();
        let id = Uuid::new_v4();
        for _ in 0..15 {
            store.record("deadline", id, FeedbackSignal::Positive);
        }
        assert!((store.weight("deadline", id) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn negative_feedback_floors() {
        let store = store();
        let id = Uuid::new_v4();
        for _ in 0..15 {
            store.record("noise", id, FeedbackSignal::Negative);
        }
        assert!((store.weight("noise", id) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn missing_entries_contribute_zero() {
        let store = store();
        let id = Uuid::new_v4();
        store.record("known", id, FeedbackSignal::Positive);
        let adj = store.adjustment(&["known".into(), "unknown".into()], id);
        assert!((adj - 0.1).abs() < 1e-6);
    }

    #[test]
    fn decay_shrinks_stale_weights() {
        let store = store();
        let id = Uuid::new_v4();
        store.record("old", id, FeedbackSignal::Positive);
        // Pretend 30 days pass.
        let future = Utc::now() + chrono::Duration::days(30);
        store.decay(future);
        let w = store.weight("old", id);
        assert!(w > 0.0 && w < 0.1);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");

        let store = store();
        let id = Uuid::new_v4();
        store.record("topic", id, FeedbackSignal::Positive);
        store.record("topic", id, FeedbackSignal::Positive);
        store.save(&path).unwrap();

        let restored = LearningStore::new(EngineConfig::default().learning);
        restored.load(&path).unwrap();
        assert!((restored.weight("topic", id) - 0.2).abs() < 1e-6);
        assert_eq!(restored.progress().positive_signals, 2);
    }
}

//! Tag frequency and pairwise cooccurrence graph.
//!
//! Nodes are canonical (lower-cased) tags, edges count cooccurrences across
//! chunks. Edge strength is normalized with a PMI-style form before use:
//! `pmi(a, b) = ln((N * w(a, b)) / (w(a) * w(b)))`, clamped to [0, ∞).
//! The graph is rebuildable from the chunk set at any time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use parking_lot::RwLock;
use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagInfo {
    /// Number of chunks currently carrying this tag.
    pub frequency: u64,
    /// Number of distinct chunks ever seen with this tag (monotonic).
    pub document_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagGraphStats {
    pub tag_count: usize,
    pub relation_count: usize,
    pub document_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagNode {
    name: String,
    frequency: u64,
    document_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoEdge {
    weight: u64,
}

struct Inner {
    graph: UnGraph<TagNode, CoEdge>,
    by_name: HashMap<String, NodeIndex>,
    /// Distinct chunks ever recorded (monotonic).
    document_count: u64,
}

/// Serialized snapshot shape; node indices are not stable across loads, so
/// edges are stored by tag name.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    tags: Vec<TagNode>,
    edges: Vec<(String, String, u64)>,
    document_count: u64,
}

/// Read-mostly cooccurrence graph. Updates take the exclusive latch for the
/// duration of one chunk's tag set.
pub struct TagGraph {
    inner: RwLock<Inner>,
}

impl TagGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                graph: UnGraph::new_undirected(),
                by_name: HashMap::new(),
                document_count: 0,
            }),
        }
    }

    fn node_for(inner: &mut Inner, name: &str) -> NodeIndex {
        if let Some(&idx) = inner.by_name.get(name) {
            return idx;
        }
        let idx = inner.graph.add_node(TagNode {
            name: name.to_string(),
            frequency: 0,
            document_count: 0,
        });
        inner.by_name.insert(name.to_string(), idx);
        idx
    }

    /// Record one chunk's tag set: bumps each tag's frequency and every
    /// unordered pair's cooccurrence weight.
    pub fn record_chunk(&self, tags: &[String]) {
        let unique: Vec<&String> = {
            let mut seen = HashSet::new();
            tags.iter().filter(|t| seen.insert(t.as_str())).collect()
        };
        if unique.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        inner.document_count += 1;

        let indices: Vec<NodeIndex> = unique
            .iter()
            .map(|t| Self::node_for(&mut inner, t))
            .collect();
        for &idx in &indices {
            let node = &mut inner.graph[idx];
            node.frequency += 1;
            node.document_count += 1;
        }
        for i in 0..indices.len() {
            for j in (i + 1)..indices.len() {
                match inner.graph.find_edge(indices[i], indices[j]) {
                    Some(edge) => inner.graph[edge].weight += 1,
                    None => {
                        inner
                            .graph
                            .add_edge(indices[i], indices[j], CoEdge { weight: 1 });
                    }
                }
            }
        }
    }

    /// Unwind one chunk's tag set after a delete. Frequencies and edge
    /// weights decrement (saturating); `document_count` stays monotonic.
    pub fn remove_chunk(&self, tags: &[String]) {
        let unique: Vec<&String> = {
            let mut seen = HashSet::new();
            tags.iter().filter(|t| seen.insert(t.as_str())).collect()
        };
        if unique.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        let indices: Vec<NodeIndex> = unique
            .iter()
            .filter_map(|t| inner.by_name.get(t.as_str()).copied())
            .collect();
        for &idx in &indices {
            let node = &mut inner.graph[idx];
            node.frequency = node.frequency.saturating_sub(1);
        }
        for i in 0..indices.len() {
            for j in (i + 1)..indices.len() {
                if let Some(edge) = inner.graph.find_edge(indices[i], indices[j]) {
                    let weight = &mut inner.graph[edge].weight;
                    *weight = weight.saturating_sub(1);
                }
            }
        }
    }

    fn pmi_of(inner: &Inner, a: NodeIndex, b: NodeIndex) -> f32 {
        let Some(edge) = inner.graph.find_edge(a, b) else {
            return 0.0;
        };
        let w_ab = inner.graph[edge].weight as f32;
        let w_a = inner.graph[a].frequency as f32;
        let w_b = inner.graph[b].frequency as f32;
        if w_ab == 0.0 || w_a == 0.0 || w_b == 0.0 || inner.document_count == 0 {
            return 0.0;
        }
        let n = inner.document_count as f32;
        ((n * w_ab) / (w_a * w_b)).ln().max(0.0)
    }

    /// Normalized cooccurrence strength between two tags; 0 when unrelated.
    pub fn normalized_weight(&self, a: &str, b: &str) -> f32 {
        let inner = self.inner.read();
        match (inner.by_name.get(a), inner.by_name.get(b)) {
            (Some(&ia), Some(&ib)) => Self::pmi_of(&inner, ia, ib),
            _ => 0.0,
        }
    }

    fn strongest_edge(inner: &Inner, idx: NodeIndex) -> f32 {
        inner
            .graph
            .neighbors(idx)
            .map(|n| Self::pmi_of(inner, idx, n))
            .fold(0.0f32, f32::max)
    }

    /// Breadth-limited expansion of a seed tag set.
    ///
    /// Depth-1 neighbors are admitted when their normalized weight reaches
    /// `min_weight`; deeper hops are admitted at 0.7 of the originating
    /// seed's strongest edge. Returns the seeds found in the graph plus
    /// every admitted tag.
    pub fn expand(&self, seeds: &[String], depth: usize, min_weight: f32) -> Vec<String> {
        let inner = self.inner.read();
        let mut admitted: Vec<String> = Vec::new();
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<(NodeIndex, usize, f32)> = VecDeque::new();

        for seed in seeds {
            if let Some(&idx) = inner.by_name.get(seed.as_str()) {
                if visited.insert(idx) {
                    admitted.push(seed.clone());
                    let deep_threshold = 0.7 * Self::strongest_edge(&inner, idx);
                    queue.push_back((idx, 0, deep_threshold));
                }
            }
        }

        while let Some((node, node_depth, deep_threshold)) = queue.pop_front() {
            if node_depth >= depth {
                continue;
            }
            let threshold = if node_depth == 0 {
                min_weight
            } else {
                deep_threshold
            };
            let mut neighbors: Vec<NodeIndex> = inner.graph.neighbors(node).collect();
            neighbors.sort_by_key(|n| inner.graph[*n].name.clone());
            for neighbor in neighbors {
                if visited.contains(&neighbor) {
                    continue;
                }
                if Self::pmi_of(&inner, node, neighbor) >= threshold {
                    visited.insert(neighbor);
                    admitted.push(inner.graph[neighbor].name.clone());
                    queue.push_back((neighbor, node_depth + 1, deep_threshold));
                }
            }
        }

        admitted
    }

    pub fn info(&self, tag: &str) -> Option<TagInfo> {
        let inner = self.inner.read();
        inner.by_name.get(tag).map(|&idx| {
            let node = &inner.graph[idx];
            TagInfo {
                frequency: node.frequency,
                document_count: node.document_count,
            }
        })
    }

    pub fn frequency(&self, tag: &str) -> u64 {
        self.info(tag).map(|i| i.frequency).unwrap_or(0)
    }

    pub fn stats(&self) -> TagGraphStats {
        let inner = self.inner.read();
        TagGraphStats {
            tag_count: inner.graph.node_count(),
            relation_count: inner.graph.edge_count(),
            document_count: inner.document_count,
        }
    }

    /// True once any cooccurrence data exists; tag boosting is skipped until then.
    pub fn has_cooccurrence_data(&self) -> bool {
        self.inner.read().graph.edge_count() > 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.graph.clear();
        inner.by_name.clear();
        inner.document_count = 0;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let mut tags: Vec<TagNode> = inner
            .graph
            .node_indices()
            .map(|idx| inner.graph[idx].clone())
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));

        let edges: Vec<(String, String, u64)> = inner
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = inner.graph.edge_endpoints(e)?;
                Some((
                    inner.graph[a].name.clone(),
                    inner.graph[b].name.clone(),
                    inner.graph[e].weight,
                ))
            })
            .collect();

        let snapshot = Snapshot {
            tags,
            edges,
            document_count: inner.document_count,
        };
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| EngineError::IndexConsistency(format!("tag graph serialize: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| EngineError::IndexConsistency(format!("tag graph snapshot: {}", e)))?;

        let graph = Self::new();
        {
            let mut inner = graph.inner.write();
            for tag in snapshot.tags {
                let idx = inner.graph.add_node(tag.clone());
                inner.by_name.insert(tag.name, idx);
            }
            for (a, b, weight) in snapshot.edges {
                if let (Some(&ia), Some(&ib)) = (inner.by_name.get(&a), inner.by_name.get(&b)) {
                    inner.graph.add_edge(ia, ib, CoEdge { weight });
                }
            }
            inner.document_count = snapshot.document_count;
        }
        Ok(graph)
    }
}

impl Default for TagGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn frequency_tracks_recorded_chunks() {
        let graph = TagGraph::new();
        graph.record_chunk(&tags(&["work", "deadline"]));
        graph.record_chunk(&tags(&["work", "meeting"]));
        assert_eq!(graph.frequency("work"), 2);
        assert_eq!(graph.frequency("deadline"), 1);
        assert_eq!(graph.frequency("unknown"), 0);

        let stats = graph.stats();
        assert_eq!(stats.tag_count, 3);
        assert_eq!(stats.relation_count, 2);
        assert_eq!(stats.document_count, 2);
    }

    #[test]
    fn remove_chunk_unwinds_frequency_but_not_document_count() {
        let graph = TagGraph::new();
        graph.record_chunk(&tags(&["work", "deadline"]));
        graph.remove_chunk(&tags(&["work", "deadline"]));
        assert_eq!(graph.frequency("work"), 0);
        let info = graph.info("work").unwrap();
        assert_eq!(info.document_count, 1);
    }

    #[test]
    fn duplicate_tags_in_one_chunk_count_once() {
        let graph = TagGraph::new();
        graph.record_chunk(&tags(&["work", "work", "deadline"]));
        assert_eq!(graph.frequency("work"), 1);
    }

    #[test]
    fn pmi_is_clamped_nonnegative() {
        let graph = TagGraph::new();
        // "common" pairs with everything, making its edges uninformative.
        graph.record_chunk(&tags(&["common", "a"]));
        graph.record_chunk(&tags(&["common", "b"]));
        graph.record_chunk(&tags(&["common", "c"]));
        graph.record_chunk(&tags(&["common", "d"]));
        assert!(graph.normalized_weight("common", "a") >= 0.0);
        assert_eq!(graph.normalized_weight("a", "b"), 0.0);
    }

    #[test]
    fn expand_admits_strong_neighbors() {
        let graph = TagGraph::new();
        // "rust" and "cargo" always cooccur; "rust" and "lunch" once among many.
        for _ in 0..5 {
            graph.record_chunk(&tags(&["rust", "cargo"]));
        }
        graph.record_chunk(&tags(&["rust", "lunch"]));
        for _ in 0..10 {
            graph.record_chunk(&tags(&["lunch"]));
        }

        let strong = graph.normalized_weight("rust", "cargo");
        let weak = graph.normalized_weight("rust", "lunch");
        assert!(strong > weak);

        let expanded = graph.expand(&tags(&["rust"]), 1, weak + 0.01);
        assert!(expanded.contains(&"rust".to_string()));
        assert!(expanded.contains(&"cargo".to_string()));
        assert!(!expanded.contains(&"lunch".to_string()));
    }

    #[test]
    fn expand_unknown_seed_is_empty() {
        let graph = TagGraph::new();
        assert!(graph.expand(&tags(&["ghost"]), 2, 0.0).is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");

        let graph = TagGraph::new();
        graph.record_chunk(&tags(&["work", "deadline"]));
        graph.record_chunk(&tags(&["work", "meeting"]));
        graph.save(&path).unwrap();

        let loaded = TagGraph::load(&path).unwrap();
        assert_eq!(loaded.stats().tag_count, graph.stats().tag_count);
        assert_eq!(loaded.stats().relation_count, graph.stats().relation_count);
        assert_eq!(loaded.frequency("work"), 2);
    }
}

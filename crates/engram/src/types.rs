use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Originating backend of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Knowledge,
    Memory,
    Diary,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge",
            Self::Memory => "memory",
            Self::Diary => "diary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "knowledge" => Some(Self::Knowledge),
            "memory" => Some(Self::Memory),
            "diary" => Some(Self::Diary),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access-scoping triple. Empty fields mean "unscoped".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub character_name: Option<String>,
}

impl Owner {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.agent_id.is_none() && self.character_name.is_none()
    }
}

/// Typed metadata bag attached to every chunk.
///
/// Covers the shapes the engine actually consumes; anything else rides in
/// `custom` as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Normalized (lower-cased, trimmed) tag strings, order preserved.
    pub tags: Vec<String>,
    /// Importance on a 0–10 scale.
    pub importance: u8,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Free-form type label ("fact", "preference", ...).
    pub kind: Option<String>,
    /// Opaque pass-through JSON.
    pub custom: serde_json::Value,
}

impl Default for ChunkMetadata {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            importance: 5,
            confidence: 1.0,
            kind: None,
            custom: serde_json::Value::Null,
        }
    }
}

impl ChunkMetadata {
    /// Normalize tags in place: trim, lower-case, drop empties and repeats.
    pub fn normalize_tags(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.tags = self
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
    }
}

/// The atomic unit of stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub content: String,
    pub content_hash: String,
    pub source: MemorySource,
    pub owner: Owner,
    /// Groups chunks that originated from the same ingested document.
    pub loader_id: Option<String>,
    /// Absent means "not yet indexed".
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Build a new chunk from trimmed content. Content is hashed here so the
    /// store never sees a chunk whose hash disagrees with its text.
    pub fn new(content: &str, source: MemorySource) -> Self {
        let trimmed = content.trim().to_string();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash(&trimmed),
            content: trimmed,
            source,
            owner: Owner::default(),
            loader_id: None,
            embedding: None,
            created_at: now,
            updated_at: now,
            metadata: ChunkMetadata::default(),
        }
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self.metadata.normalize_tags();
        self
    }
}

/// Hex SHA-256 fingerprint used for exact-duplicate detection.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Row filter shared by list / delete / count operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    pub source: Option<MemorySource>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub character_name: Option<String>,
    pub loader_id: Option<String>,
}

impl MemoryFilter {
    pub fn for_source(source: MemorySource) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True if the chunk passes every populated field.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(source) = self.source {
            if chunk.source != source {
                return false;
            }
        }
        if let Some(ref user_id) = self.user_id {
            if chunk.owner.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            if chunk.owner.agent_id.as_deref() != Some(agent_id.as_str()) {
                return false;
            }
        }
        if let Some(ref character) = self.character_name {
            if chunk.owner.character_name.as_deref() != Some(character.as_str()) {
                return false;
            }
        }
        if let Some(ref loader_id) = self.loader_id {
            if chunk.loader_id.as_deref() != Some(loader_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A retrieval hit, ready for fusion and re-ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub id: Uuid,
    pub content: String,
    /// Final combined score in [0, 1].
    pub score: f32,
    /// Raw vector-similarity component.
    pub vec_score: f32,
    /// Normalized BM25 component.
    pub bm25_score: f32,
    pub source: MemorySource,
    /// Name of the backend that produced this hit.
    pub backend: String,
    pub tags: Vec<String>,
    pub metadata: ChunkMetadata,
    /// Set when the producing pipeline fell back to text-only search.
    pub degraded: bool,
}

impl ScoredMemory {
    pub fn from_chunk(chunk: &Chunk, score: f32, backend: &str) -> Self {
        Self {
            id: chunk.id,
            content: chunk.content.clone(),
            score,
            vec_score: score,
            bm25_score: 0.0,
            source: chunk.source,
            backend: backend.to_string(),
            tags: chunk.metadata.tags.clone(),
            metadata: chunk.metadata.clone(),
            degraded: false,
        }
    }

    /// Stable duplicate-detection key: an explicit id from the custom
    /// metadata when present, the chunk id otherwise, and a content
    /// fingerprint as the last resort for id-less items.
    pub fn dedup_key(&self) -> String {
        for key in ["id", "chunk_id", "unique_id", "document_id"] {
            if let Some(v) = self.metadata.custom.get(key).and_then(|v| v.as_str()) {
                if !v.is_empty() {
                    return v.to_string();
                }
            }
        }
        if !self.id.is_nil() {
            return self.id.to_string();
        }
        let normalized: String = self
            .content
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(300)
            .collect();
        content_hash(&normalized)
    }
}

/// Envelope returned by every public coordinator operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub elapsed_ms: u64,
    pub cache_hit: bool,
    pub degraded: bool,
    pub backends: Vec<String>,
}

impl<T> ResultEnvelope<T> {
    pub fn ok(data: T, meta: ResponseMeta) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    pub fn err(error: impl Into<String>, meta: ResponseMeta) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            meta,
        }
    }
}

/// Lifecycle state of an asynchronous collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Bookkeeping record for asynchronous extraction calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncTask {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for AsyncTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("the sky is blue"), content_hash("the sky is blue"));
        assert_ne!(content_hash("the sky is blue"), content_hash("the sky is red"));
    }

    #[test]
    fn chunk_new_trims_and_hashes() {
        let chunk = Chunk::new("  hello world  ", MemorySource::Memory);
        assert_eq!(chunk.content, "hello world");
        assert_eq!(chunk.content_hash, content_hash("hello world"));
        assert!(chunk.embedding.is_none());
    }

    #[test]
    fn tag_normalization_dedups() {
        let chunk = Chunk::new("x", MemorySource::Memory).with_tags(vec![
            " Work ".into(),
            "work".into(),
            "Deadline".into(),
            "".into(),
        ]);
        assert_eq!(chunk.metadata.tags, vec!["work", "deadline"]);
    }

    #[test]
    fn filter_matches_owner_fields() {
        let mut chunk = Chunk::new("x", MemorySource::Diary);
        chunk.owner.character_name = Some("alice".into());

        let mut filter = MemoryFilter::for_source(MemorySource::Diary);
        assert!(filter.matches(&chunk));
        filter.character_name = Some("bob".into());
        assert!(!filter.matches(&chunk));
    }

    #[test]
    fn dedup_key_prefers_metadata_id() {
        let mut item = ScoredMemory::from_chunk(&Chunk::new("abc", MemorySource::Memory), 0.5, "t");
        assert_eq!(item.dedup_key(), item.id.to_string());
        item.metadata.custom = serde_json::json!({ "chunk_id": "external-7" });
        assert_eq!(item.dedup_key(), "external-7");
    }
}

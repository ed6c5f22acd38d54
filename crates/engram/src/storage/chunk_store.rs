//! Durable chunk storage over a single-file SQLite database.
//!
//! Single-writer, many-reader: every operation runs on one connection behind
//! a mutex, with WAL mode keeping readers cheap. Mutations are short
//! transactions covering the chunk row, its tag rows, and the history table
//! together. Embeddings are stored as raw little-endian f32 blobs.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::{Chunk, ChunkMetadata, MemoryFilter, MemorySource, Owner};

/// Columns the current schema expects on `chunks`; anything missing in an
/// older database is added in place at open. A failed migration is fatal.
const CHUNK_COLUMNS: &[(&str, &str)] = &[
    ("loader_id", "TEXT"),
    ("embedding", "BLOB"),
    ("importance", "INTEGER NOT NULL DEFAULT 5"),
    ("confidence", "REAL NOT NULL DEFAULT 1.0"),
    ("kind", "TEXT"),
    ("custom_json", "TEXT NOT NULL DEFAULT 'null'"),
];

/// Partial update applied by [`ChunkStore::update`]. A changed `content`
/// requires the caller to supply the matching new hash (and normally a new
/// embedding, or an explicit clear so reindexing can find the row).
#[derive(Debug, Clone, Default)]
pub struct ChunkPatch {
    pub content: Option<String>,
    pub content_hash: Option<String>,
    /// Outer `Some` means "set the column": `Some(vec)` stores a vector,
    /// `None` clears it (not yet indexed).
    pub embedding: Option<Option<Vec<f32>>>,
    pub metadata: Option<ChunkMetadata>,
}

pub struct ChunkStore {
    conn: Mutex<Connection>,
}

pub fn embedding_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(EngineError::IndexConsistency(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn owner_column(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn column_to_owner(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// Escape `%`, `_` and the escape char itself for a LIKE pattern.
fn escape_like(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl ChunkStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_tables()?;
        store.migrate()?;
        store.ensure_indices()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                source TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                agent_id TEXT NOT NULL DEFAULT '',
                character_name TEXT NOT NULL DEFAULT '',
                loader_id TEXT,
                embedding BLOB,
                importance INTEGER NOT NULL DEFAULT 5,
                confidence REAL NOT NULL DEFAULT 1.0,
                kind TEXT,
                custom_json TEXT NOT NULL DEFAULT 'null',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunk_tags (
                chunk_id TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (chunk_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_chunk_tags_tag ON chunk_tags(tag);

            CREATE TABLE IF NOT EXISTS tags (
                name TEXT PRIMARY KEY,
                frequency INTEGER NOT NULL DEFAULT 0,
                document_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS files (
                loader_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memory_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_id TEXT NOT NULL,
                event TEXT NOT NULL,
                content TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Add columns an older database is missing. Runs once at open.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut existing = std::collections::HashSet::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(chunks)")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                existing.insert(row.get::<_, String>(1)?);
            }
        }
        for (name, definition) in CHUNK_COLUMNS {
            if !existing.contains(*name) {
                tracing::info!(column = name, "Migrating chunks table: adding column");
                conn.execute(
                    &format!("ALTER TABLE chunks ADD COLUMN {} {}", name, definition),
                    [],
                )?;
            }
        }
        Ok(())
    }

    /// Indices on every filter column, created after migration so they can
    /// reference columns added to older databases.
    fn ensure_indices(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_hash_scope
                ON chunks(content_hash, source, user_id, agent_id, character_name);
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);
            CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks(user_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_agent ON chunks(agent_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_character ON chunks(character_name);
            CREATE INDEX IF NOT EXISTS idx_chunks_loader ON chunks(loader_id);
            "#,
        )?;
        Ok(())
    }

    /// Insert a chunk, enforcing content-hash uniqueness within its
    /// `(source, owner)` partition. Returns the id on success and a
    /// `Duplicate` signal carrying the existing id otherwise.
    pub fn insert(&self, chunk: &Chunk) -> Result<Uuid> {
        if chunk.content.trim().is_empty() {
            return Err(EngineError::validation("chunk content must not be empty"));
        }
        if chunk.metadata.importance > 10 {
            return Err(EngineError::validation("importance must be in 0..=10"));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM chunks
                 WHERE content_hash = ?1 AND source = ?2
                   AND user_id = ?3 AND agent_id = ?4 AND character_name = ?5",
                params![
                    chunk.content_hash,
                    chunk.source.as_str(),
                    owner_column(&chunk.owner.user_id),
                    owner_column(&chunk.owner.agent_id),
                    owner_column(&chunk.owner.character_name),
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            let existing_id = Uuid::parse_str(&existing)
                .map_err(|e| EngineError::validation(format!("corrupt stored id: {}", e)))?;
            return Err(EngineError::Duplicate { existing_id });
        }

        tx.execute(
            "INSERT INTO chunks (id, content, content_hash, source, user_id, agent_id,
                                 character_name, loader_id, embedding, importance, confidence,
                                 kind, custom_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                chunk.id.to_string(),
                chunk.content,
                chunk.content_hash,
                chunk.source.as_str(),
                owner_column(&chunk.owner.user_id),
                owner_column(&chunk.owner.agent_id),
                owner_column(&chunk.owner.character_name),
                chunk.loader_id,
                chunk.embedding.as_deref().map(embedding_to_blob),
                chunk.metadata.importance,
                chunk.metadata.confidence,
                chunk.metadata.kind,
                serde_json::to_string(&chunk.metadata.custom).unwrap_or_else(|_| "null".into()),
                timestamp(chunk.created_at),
                timestamp(chunk.updated_at),
            ],
        )?;

        Self::write_tags(&tx, chunk.id, &chunk.metadata.tags)?;

        if let Some(ref loader_id) = chunk.loader_id {
            let now = timestamp(Utc::now());
            tx.execute(
                "INSERT INTO files (loader_id, source, chunk_count, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?3)
                 ON CONFLICT(loader_id) DO UPDATE SET
                     chunk_count = chunk_count + 1, updated_at = ?3",
                params![loader_id, chunk.source.as_str(), now],
            )?;
        }

        tx.execute(
            "INSERT INTO memory_history (memory_id, event, content, created_at)
             VALUES (?1, 'added', ?2, ?3)",
            params![chunk.id.to_string(), chunk.content, timestamp(Utc::now())],
        )?;

        tx.commit()?;
        Ok(chunk.id)
    }

    fn write_tags(tx: &rusqlite::Transaction<'_>, chunk_id: Uuid, tags: &[String]) -> Result<()> {
        for (position, tag) in tags.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO chunk_tags (chunk_id, tag, position) VALUES (?1, ?2, ?3)",
                params![chunk_id.to_string(), tag, position as i64],
            )?;
            tx.execute(
                "INSERT INTO tags (name, frequency, document_count) VALUES (?1, 1, 1)
                 ON CONFLICT(name) DO UPDATE SET
                     frequency = frequency + 1, document_count = document_count + 1",
                params![tag],
            )?;
        }
        Ok(())
    }

    fn unwind_tags(tx: &rusqlite::Transaction<'_>, chunk_id: &str) -> Result<()> {
        let mut stmt = tx.prepare("SELECT tag FROM chunk_tags WHERE chunk_id = ?1")?;
        let tags: Vec<String> = stmt
            .query_map(params![chunk_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        for tag in tags {
            tx.execute(
                "UPDATE tags SET frequency = MAX(frequency - 1, 0) WHERE name = ?1",
                params![tag],
            )?;
        }
        tx.execute(
            "DELETE FROM chunk_tags WHERE chunk_id = ?1",
            params![chunk_id],
        )?;
        Ok(())
    }

    fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
        let id: String = row.get("id")?;
        let source: String = row.get("source")?;
        let blob: Option<Vec<u8>> = row.get("embedding")?;
        let custom_json: String = row.get("custom_json")?;

        Ok(Chunk {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
            source: MemorySource::parse(&source).unwrap_or(MemorySource::Memory),
            owner: Owner {
                user_id: column_to_owner(row.get("user_id")?),
                agent_id: column_to_owner(row.get("agent_id")?),
                character_name: column_to_owner(row.get("character_name")?),
            },
            loader_id: row.get("loader_id")?,
            embedding: blob.and_then(|b| blob_to_embedding(&b).ok()),
            created_at: from_timestamp(row.get("created_at")?),
            updated_at: from_timestamp(row.get("updated_at")?),
            metadata: ChunkMetadata {
                tags: Vec::new(),
                importance: row.get::<_, i64>("importance")?.clamp(0, 10) as u8,
                confidence: row.get("confidence")?,
                kind: row.get("kind")?,
                custom: serde_json::from_str(&custom_json).unwrap_or(serde_json::Value::Null),
            },
        })
    }

    fn load_tags(conn: &Connection, chunk_id: Uuid) -> rusqlite::Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT tag FROM chunk_tags WHERE chunk_id = ?1 ORDER BY position")?;
        let tags = stmt
            .query_map(params![chunk_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    /// Keyed O(1) lookup by primary key.
    pub fn get(&self, id: Uuid) -> Result<Option<Chunk>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                "SELECT * FROM chunks WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_chunk,
            )
            .optional()?;
        match chunk {
            Some(mut chunk) => {
                chunk.metadata.tags = Self::load_tags(&conn, chunk.id)?;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    pub fn find_by_hash(&self, hash: &str) -> Result<Option<Chunk>> {
        let conn = self.conn.lock();
        let chunk = conn
            .query_row(
                "SELECT * FROM chunks WHERE content_hash = ?1 LIMIT 1",
                params![hash],
                Self::row_to_chunk,
            )
            .optional()?;
        match chunk {
            Some(mut chunk) => {
                chunk.metadata.tags = Self::load_tags(&conn, chunk.id)?;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Apply a partial update and return the new row state.
    pub fn update(&self, id: Uuid, patch: ChunkPatch) -> Result<Chunk> {
        if patch.content.is_some() && patch.content_hash.is_none() {
            return Err(EngineError::validation(
                "content updates must supply a new content_hash",
            ));
        }

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let now = timestamp(Utc::now());

            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM chunks WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(EngineError::validation(format!("unknown chunk id {}", id)));
            }

            if let Some(ref content) = patch.content {
                if content.trim().is_empty() {
                    return Err(EngineError::validation("chunk content must not be empty"));
                }
                tx.execute(
                    "UPDATE chunks SET content = ?2, content_hash = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        content.trim(),
                        patch.content_hash.as_deref().unwrap_or_default(),
                        now
                    ],
                )?;
                tx.execute(
                    "INSERT INTO memory_history (memory_id, event, content, created_at)
                     VALUES (?1, 'updated', ?2, ?3)",
                    params![id.to_string(), content.trim(), now],
                )?;
            }

            if let Some(embedding) = patch.embedding {
                tx.execute(
                    "UPDATE chunks SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
                    params![
                        id.to_string(),
                        embedding.as_deref().map(embedding_to_blob),
                        now
                    ],
                )?;
            }

            if let Some(metadata) = patch.metadata {
                tx.execute(
                    "UPDATE chunks SET importance = ?2, confidence = ?3, kind = ?4,
                            custom_json = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        metadata.importance,
                        metadata.confidence,
                        metadata.kind,
                        serde_json::to_string(&metadata.custom).unwrap_or_else(|_| "null".into()),
                        now
                    ],
                )?;
                Self::unwind_tags(&tx, &id.to_string())?;
                Self::write_tags(&tx, id, &metadata.tags)?;
            }

            tx.commit()?;
        }

        self.get(id)?
            .ok_or_else(|| EngineError::validation(format!("unknown chunk id {}", id)))
    }

    /// Store a freshly computed embedding for one chunk.
    pub fn set_embedding(&self, id: Uuid, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE chunks SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                embedding_to_blob(vector),
                timestamp(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::validation(format!("unknown chunk id {}", id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::unwind_tags(&tx, &id.to_string())?;
        let deleted = tx.execute("DELETE FROM chunks WHERE id = ?1", params![id.to_string()])?;
        if deleted > 0 {
            tx.execute(
                "INSERT INTO memory_history (memory_id, event, content, created_at)
                 VALUES (?1, 'deleted', NULL, ?2)",
                params![id.to_string(), timestamp(Utc::now())],
            )?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn filter_clause(filter: &MemoryFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(source) = filter.source {
            clauses.push("source = ?".to_string());
            values.push(source.as_str().to_string());
        }
        if let Some(ref user_id) = filter.user_id {
            clauses.push("user_id = ?".to_string());
            values.push(user_id.clone());
        }
        if let Some(ref agent_id) = filter.agent_id {
            clauses.push("agent_id = ?".to_string());
            values.push(agent_id.clone());
        }
        if let Some(ref character) = filter.character_name {
            clauses.push("character_name = ?".to_string());
            values.push(character.clone());
        }
        if let Some(ref loader_id) = filter.loader_id {
            clauses.push("loader_id = ?".to_string());
            values.push(loader_id.clone());
        }
        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (clause, values)
    }

    /// Delete every chunk matching the filter, returning the removed ids.
    pub fn delete_by_filter(&self, filter: &MemoryFilter) -> Result<Vec<Uuid>> {
        let (clause, values) = Self::filter_clause(filter);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&format!("SELECT id FROM chunks{}", clause))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let now = timestamp(Utc::now());
        for id in &ids {
            Self::unwind_tags(&tx, id)?;
            tx.execute("DELETE FROM chunks WHERE id = ?1", params![id])?;
            tx.execute(
                "INSERT INTO memory_history (memory_id, event, content, created_at)
                 VALUES (?1, 'deleted', NULL, ?2)",
                params![id, now],
            )?;
        }
        tx.commit()?;

        Ok(ids
            .into_iter()
            .filter_map(|id| Uuid::parse_str(&id).ok())
            .collect())
    }

    pub fn list(&self, filter: &MemoryFilter, limit: usize, offset: usize) -> Result<Vec<Chunk>> {
        let (clause, values) = Self::filter_clause(filter);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM chunks{} ORDER BY created_at DESC, id LIMIT {} OFFSET {}",
            clause, limit, offset
        ))?;
        let mut chunks: Vec<Chunk> = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_chunk)?
            .collect::<rusqlite::Result<_>>()?;
        for chunk in &mut chunks {
            chunk.metadata.tags = Self::load_tags(&conn, chunk.id)?;
        }
        Ok(chunks)
    }

    /// Fallback substring scan, used when no query embedding is available.
    pub fn text_search(
        &self,
        pattern: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let (clause, mut values) = Self::filter_clause(filter);
        let like_clause = if clause.is_empty() {
            " WHERE content LIKE ? ESCAPE '\\'".to_string()
        } else {
            format!("{} AND content LIKE ? ESCAPE '\\'", clause)
        };
        values.push(format!("%{}%", escape_like(pattern)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM chunks{} ORDER BY updated_at DESC, id LIMIT {}",
            like_clause, limit
        ))?;
        let mut chunks: Vec<Chunk> = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_chunk)?
            .collect::<rusqlite::Result<_>>()?;
        for chunk in &mut chunks {
            chunk.metadata.tags = Self::load_tags(&conn, chunk.id)?;
        }
        Ok(chunks)
    }

    pub fn count(&self, filter: &MemoryFilter) -> Result<usize> {
        let (clause, values) = Self::filter_clause(filter);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM chunks{}", clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Count rows whose embedding column is populated.
    pub fn count_embedded(&self, filter: &MemoryFilter) -> Result<usize> {
        let (clause, values) = Self::filter_clause(filter);
        let embedded_clause = if clause.is_empty() {
            " WHERE embedding IS NOT NULL".to_string()
        } else {
            format!("{} AND embedding IS NOT NULL", clause)
        };
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM chunks{}", embedded_clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Page through `(id, embedding)` pairs of rows that carry a vector,
    /// ordered by id for stable batching during index recovery.
    pub fn list_embedded(
        &self,
        filter: &MemoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(Uuid, Vec<f32>)>> {
        let (clause, values) = Self::filter_clause(filter);
        let embedded_clause = if clause.is_empty() {
            " WHERE embedding IS NOT NULL".to_string()
        } else {
            format!("{} AND embedding IS NOT NULL", clause)
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, embedding FROM chunks{} ORDER BY id LIMIT {} OFFSET {}",
            embedded_clause, limit, offset
        ))?;
        let rows: Vec<(String, Vec<u8>)> = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (id, blob) in rows {
            let id = Uuid::parse_str(&id)
                .map_err(|e| EngineError::validation(format!("corrupt stored id: {}", e)))?;
            result.push((id, blob_to_embedding(&blob)?));
        }
        Ok(result)
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Stored per-tag counters (persistent mirror of the in-memory graph).
    pub fn tag_counts(&self, tag: &str) -> Result<Option<(u64, u64)>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT frequency, document_count FROM tags WHERE name = ?1",
                params![tag],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::content_hash;

    fn store() -> ChunkStore {
        ChunkStore::open_in_memory().unwrap()
    }

    fn chunk(content: &str, source: MemorySource) -> Chunk {
        Chunk::new(content, source)
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = store();
        let mut c = chunk("The sky is blue", MemorySource::Memory).with_tags(vec!["sky".into()]);
        c.embedding = Some(vec![0.1, 0.2, 0.3]);
        let id = store.insert(&c).unwrap();

        let got = store.get(id).unwrap().unwrap();
        assert_eq!(got.content, "The sky is blue");
        assert_eq!(got.metadata.tags, vec!["sky"]);
        assert_eq!(got.embedding.unwrap(), vec![0.1, 0.2, 0.3]);
        assert_eq!(got.content_hash, content_hash("The sky is blue"));
    }

    #[test]
    fn duplicate_insert_returns_existing_id() {
        let store = store();
        let first = chunk("The sky is blue", MemorySource::Memory);
        let id = store.insert(&first).unwrap();

        let second = chunk("The sky is blue", MemorySource::Memory);
        match store.insert(&second) {
            Err(EngineError::Duplicate { existing_id }) => assert_eq!(existing_id, id),
            other => panic!("expected duplicate signal, got {:?}", other.map(|_| ())),
        }
        assert_eq!(
            store
                .count(&MemoryFilter::for_source(MemorySource::Memory))
                .unwrap(),
            1
        );
    }

    #[test]
    fn same_hash_different_partition_is_allowed() {
        let store = store();
        store
            .insert(&chunk("The sky is blue", MemorySource::Memory))
            .unwrap();
        store
            .insert(&chunk("The sky is blue", MemorySource::Diary))
            .unwrap();

        let mut owned = chunk("The sky is blue", MemorySource::Memory);
        owned.owner.user_id = Some("u1".into());
        store.insert(&owned).unwrap();

        assert_eq!(store.count(&MemoryFilter::default()).unwrap(), 3);
    }

    #[test]
    fn find_by_hash_returns_chunk() {
        let store = store();
        let c = chunk("needle in haystack", MemorySource::Knowledge);
        store.insert(&c).unwrap();
        let found = store.find_by_hash(&c.content_hash).unwrap().unwrap();
        assert_eq!(found.id, c.id);
        assert!(store.find_by_hash("missing").unwrap().is_none());
    }

    #[test]
    fn rejects_empty_content() {
        let store = store();
        let c = chunk("   ", MemorySource::Memory);
        assert!(matches!(
            store.insert(&c),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn update_content_requires_hash() {
        let store = store();
        let c = chunk("version one", MemorySource::Memory);
        let id = store.insert(&c).unwrap();

        let bad = ChunkPatch {
            content: Some("version two".into()),
            ..ChunkPatch::default()
        };
        assert!(matches!(
            store.update(id, bad),
            Err(EngineError::Validation(_))
        ));

        let good = ChunkPatch {
            content: Some("version two".into()),
            content_hash: Some(content_hash("version two")),
            embedding: Some(None),
            ..ChunkPatch::default()
        };
        let updated = store.update(id, good).unwrap();
        assert_eq!(updated.content, "version two");
        assert!(updated.embedding.is_none());
    }

    #[test]
    fn update_metadata_replaces_tags() {
        let store = store();
        let c = chunk("tagged", MemorySource::Memory).with_tags(vec!["old".into()]);
        let id = store.insert(&c).unwrap();

        let mut metadata = ChunkMetadata::default();
        metadata.tags = vec!["new".into()];
        let updated = store
            .update(
                id,
                ChunkPatch {
                    metadata: Some(metadata),
                    ..ChunkPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.metadata.tags, vec!["new"]);
        assert_eq!(store.tag_counts("old").unwrap().unwrap().0, 0);
        assert_eq!(store.tag_counts("new").unwrap().unwrap().0, 1);
    }

    #[test]
    fn delete_removes_row_and_tags() {
        let store = store();
        let c = chunk("temp", MemorySource::Memory).with_tags(vec!["temp".into()]);
        let id = store.insert(&c).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.tag_counts("temp").unwrap().unwrap().0, 0);
    }

    #[test]
    fn delete_by_filter_scopes_correctly() {
        let store = store();
        store.insert(&chunk("a", MemorySource::Memory)).unwrap();
        store.insert(&chunk("b", MemorySource::Memory)).unwrap();
        store.insert(&chunk("c", MemorySource::Diary)).unwrap();

        let deleted = store
            .delete_by_filter(&MemoryFilter::for_source(MemorySource::Memory))
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(store.count(&MemoryFilter::default()).unwrap(), 1);
    }

    #[test]
    fn list_respects_limit_and_offset() {
        let store = store();
        for i in 0..5 {
            store
                .insert(&chunk(&format!("item {}", i), MemorySource::Memory))
                .unwrap();
        }
        let page = store.list(&MemoryFilter::default(), 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        let rest = store.list(&MemoryFilter::default(), 10, 2).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn text_search_escapes_like_wildcards() {
        let store = store();
        store
            .insert(&chunk("progress: 100% complete", MemorySource::Memory))
            .unwrap();
        store
            .insert(&chunk("totally unrelated", MemorySource::Memory))
            .unwrap();

        let hits = store
            .text_search("100%", &MemoryFilter::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("100%"));

        // '%' must not act as a wildcard.
        let none = store
            .text_search("100%x", &MemoryFilter::default(), 10)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn list_embedded_pages_by_id() {
        let store = store();
        for i in 0..4 {
            let mut c = chunk(&format!("vec {}", i), MemorySource::Memory);
            if i % 2 == 0 {
                c.embedding = Some(vec![i as f32; 3]);
            }
            store.insert(&c).unwrap();
        }
        assert_eq!(store.count_embedded(&MemoryFilter::default()).unwrap(), 2);
        let page = store.list_embedded(&MemoryFilter::default(), 10, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|(_, v)| v.len() == 3));
    }

    #[test]
    fn kv_store_round_trip() {
        let store = store();
        assert!(store.kv_get("model").unwrap().is_none());
        store.kv_set("model", "embed-v1").unwrap();
        store.kv_set("model", "embed-v2").unwrap();
        assert_eq!(store.kv_get("model").unwrap().unwrap(), "embed-v2");
    }

    #[test]
    fn blob_round_trip() {
        let vector = vec![0.5f32, -1.25, 3.75];
        let blob = embedding_to_blob(&vector);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_embedding(&blob).unwrap(), vector);
        assert!(blob_to_embedding(&blob[..5]).is_err());
    }

    #[test]
    fn migration_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                source TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                agent_id TEXT NOT NULL DEFAULT '',
                character_name TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .unwrap();

        let store = ChunkStore::init(conn).unwrap();
        let c = chunk("migrated row", MemorySource::Memory);
        let id = store.insert(&c).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().content, "migrated row");
    }
}

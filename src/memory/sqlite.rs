//! SQLite-based persistent storage for knowledge entries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::embeddings::cosine_distance;
use super::{
    KnowledgeEntry, KnowledgeId, KnowledgeStats, KnowledgeStore, KnowledgeUpdate, Metadata,
    Neighbor, NewKnowledge,
};
use crate::error::{KnowledgeError, Result};

const ENTRY_COLUMNS: &str =
    "id, category, title, content, embedding, metadata, created_at, updated_at";

/// SQLite-based knowledge store
pub struct SqliteKnowledgeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKnowledgeStore {
    /// Open (or create) a store at the given path
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(|e| KnowledgeError::StoreUnavailable(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(&path)?;

        // WAL lets foreground readers proceed while the learning loop writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::register_functions(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a throwaway store backed by SQLite's in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::register_functions(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// SQLite's `lower()` only folds ASCII; `fold_case()` lowercases the
    /// way queries are lowercased in Rust
    fn register_functions(conn: &Connection) -> Result<()> {
        conn.create_scalar_function(
            "fold_case",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let text: Option<String> = ctx.get(0)?;
                Ok(text.map(|t| t.to_lowercase()))
            },
        )?;
        Ok(())
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            -- AUTOINCREMENT guarantees ids are never reused after deletes
            CREATE TABLE IF NOT EXISTS knowledge (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge(category);
            CREATE INDEX IF NOT EXISTS idx_knowledge_updated ON knowledge(updated_at DESC);
        "#)?;

        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
        let embedding_blob: Option<Vec<u8>> = row.get(4)?;
        let metadata_json: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;

        Ok(KnowledgeEntry {
            id: row.get(0)?,
            category: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            embedding: embedding_blob.map(|b| Self::blob_to_embedding(&b)),
            metadata: serde_json::from_str::<Metadata>(&metadata_json).unwrap_or_default(),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn load(conn: &Connection, id: KnowledgeId) -> Result<Option<KnowledgeEntry>> {
        let sql = format!("SELECT {} FROM knowledge WHERE id = ?1", ENTRY_COLUMNS);
        let entry = conn
            .query_row(&sql, params![id], Self::row_to_entry)
            .optional()?;
        Ok(entry)
    }

    /// Convert embedding vector to binary blob
    fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for &val in embedding {
            blob.extend_from_slice(&val.to_le_bytes());
        }
        blob
    }

    /// Convert binary blob to embedding vector
    fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect()
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn metadata_to_json(metadata: &Metadata) -> Result<String> {
    serde_json::to_string(metadata)
        .map_err(|e| KnowledgeError::InvalidInput(format!("metadata: {}", e)))
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn insert(&self, entry: NewKnowledge) -> Result<KnowledgeEntry> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"INSERT INTO knowledge
               (category, title, content, embedding, metadata, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)"#,
            params![
                entry.category,
                entry.title,
                entry.content,
                entry.embedding.as_deref().map(Self::embedding_to_blob),
                metadata_to_json(&entry.metadata)?,
                now,
            ],
        )?;

        let id = conn.last_insert_rowid();
        Self::load(&conn, id)?
            .ok_or_else(|| KnowledgeError::StoreUnavailable(format!("entry {} vanished after insert", id)))
    }

    async fn get(&self, id: KnowledgeId) -> Result<Option<KnowledgeEntry>> {
        let conn = self.conn.lock().await;
        Self::load(&conn, id)
    }

    async fn update(&self, id: KnowledgeId, update: KnowledgeUpdate) -> Result<Option<KnowledgeEntry>> {
        let conn = self.conn.lock().await;
        let Some(mut entry) = Self::load(&conn, id)? else {
            return Ok(None);
        };

        if let Some(title) = update.title {
            entry.title = title;
        }
        if let Some(content) = update.content {
            entry.content = content;
        }
        if let Some(embedding) = update.embedding {
            entry.embedding = embedding;
        }
        if let Some(metadata) = update.metadata {
            entry.metadata = metadata;
        }
        entry.updated_at = Utc::now();

        conn.execute(
            r#"UPDATE knowledge
               SET title = ?2, content = ?3, embedding = ?4, metadata = ?5, updated_at = ?6
               WHERE id = ?1"#,
            params![
                id,
                entry.title,
                entry.content,
                entry.embedding.as_deref().map(Self::embedding_to_blob),
                metadata_to_json(&entry.metadata)?,
                entry.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(entry))
    }

    async fn delete(&self, id: KnowledgeId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM knowledge WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    async fn nearest_neighbor(
        &self,
        vector: &[f32],
        category: Option<&str>,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, embedding FROM knowledge
             WHERE embedding IS NOT NULL AND (?1 IS NULL OR category = ?1)",
        )?;

        let rows = stmt
            .query_map(params![category], |row| {
                let id: KnowledgeId = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut neighbors: Vec<Neighbor> = rows
            .into_iter()
            .map(|(id, blob)| Neighbor {
                id,
                distance: cosine_distance(vector, &Self::blob_to_embedding(&blob)),
            })
            .collect();

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(b.id.cmp(&a.id)));
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn lexical_candidates(
        &self,
        query: &str,
        tokens: &[String],
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        const HAYSTACK: &str = "fold_case(title || char(10) || content)";

        let mut args: Vec<String> = vec![query.trim().to_lowercase()];
        let mut clauses = vec![format!("instr({}, ?1) > 0", HAYSTACK)];
        for token in tokens {
            args.push(token.clone());
            clauses.push(format!("instr({}, ?{}) > 0", HAYSTACK, args.len()));
        }

        let mut sql = format!(
            "SELECT {} FROM knowledge WHERE ({})",
            ENTRY_COLUMNS,
            clauses.join(" OR ")
        );
        if let Some(category) = category {
            args.push(category.to_string());
            sql.push_str(&format!(" AND category = ?{}", args.len()));
        }
        sql.push_str(&format!(
            " ORDER BY (instr({}, ?1) > 0) DESC, id DESC LIMIT {}",
            HAYSTACK, limit
        ));

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn stats(&self) -> Result<KnowledgeStats> {
        let conn = self.conn.lock().await;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?;
        let embedded: i64 = conn.query_row(
            "SELECT COUNT(*) FROM knowledge WHERE embedding IS NOT NULL", [], |row| row.get(0)
        )?;

        let mut stmt = conn.prepare_cached(
            "SELECT category, COUNT(*) FROM knowledge GROUP BY category ORDER BY category",
        )?;
        let by_category = stmt
            .query_map([], |row| {
                let category: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((category, count as usize))
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(KnowledgeStats {
            total_entries: total as usize,
            embedded_entries: embedded as usize,
            by_category,
        })
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        let conn = self.conn.lock().await;
        let bytes: Option<i64> = conn
            .query_row(
                "SELECT length(embedding) FROM knowledge WHERE embedding IS NOT NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.map(|b| b as usize / 4))
    }
}

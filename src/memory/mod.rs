//! Knowledge memory
//!
//! Provides:
//! - The `KnowledgeStore` abstraction over a vector-capable persistent store
//! - SQLite and in-process store implementations
//! - Embedding backends for semantic search
//! - A TTL cache layer with shared (Redis) and local backends
//! - The hybrid (vector + lexical) search engine

pub mod sqlite;
pub mod in_memory;
pub mod embeddings;
pub mod cache;
pub mod redis_cache;
pub mod retrieval;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

pub use sqlite::SqliteKnowledgeStore;
pub use in_memory::InMemoryKnowledgeStore;
pub use embeddings::{EmbeddingProvider, EmbeddingModel, EmbeddingConfig, EmbeddingBackend, cosine_similarity};
pub use cache::{CacheLayer, CacheEntry, CacheStats, SharedCache, LocalCache};
pub use redis_cache::RedisCache;
pub use retrieval::{HybridSearchEngine, SearchMode, SearchResult, ResultSource, SearchRequest};

/// Store-assigned entry id; strictly increasing and never reused
pub type KnowledgeId = i64;

/// Free-form metadata attached to an entry
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A stored knowledge entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Unique entry ID
    pub id: KnowledgeId,
    /// Category used for filtered search
    pub category: String,
    pub title: String,
    /// The knowledge itself; never empty
    pub content: String,
    /// Vector embedding of the content, absent when embedding failed
    pub embedding: Option<Vec<f32>>,
    /// Provenance and other annotations
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Title and content, the text lexical search matches against
    pub fn searchable_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

/// Entry to insert; the store assigns id and timestamps
#[derive(Debug, Clone, Default)]
pub struct NewKnowledge {
    pub category: String,
    pub title: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct KnowledgeUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    /// `Some(None)` clears the stored vector
    pub embedding: Option<Option<Vec<f32>>>,
    pub metadata: Option<Metadata>,
}

impl KnowledgeUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.embedding.is_none()
            && self.metadata.is_none()
    }
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: KnowledgeId,
    /// Cosine distance (1 - cosine similarity)
    pub distance: f32,
}

/// Knowledge store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub total_entries: usize,
    pub embedded_entries: usize,
    pub by_category: BTreeMap<String, usize>,
}

/// Persistent, vector-capable knowledge storage
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Persist a new entry and return it with its assigned id
    async fn insert(&self, entry: NewKnowledge) -> Result<KnowledgeEntry>;

    /// Fetch an entry by id
    async fn get(&self, id: KnowledgeId) -> Result<Option<KnowledgeEntry>>;

    /// Apply a partial update; `None` when the id does not exist
    async fn update(&self, id: KnowledgeId, update: KnowledgeUpdate) -> Result<Option<KnowledgeEntry>>;

    /// Remove an entry; `false` when it did not exist
    async fn delete(&self, id: KnowledgeId) -> Result<bool>;

    /// Entries with embeddings, nearest first (ties broken by id descending)
    async fn nearest_neighbor(
        &self,
        vector: &[f32],
        category: Option<&str>,
        k: usize,
    ) -> Result<Vec<Neighbor>>;

    /// Entries whose title or content contains the query or any of its
    /// tokens, case-insensitively. Entries containing the whole query come
    /// first, newest first within each group.
    async fn lexical_candidates(
        &self,
        query: &str,
        tokens: &[String],
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;

    async fn stats(&self) -> Result<KnowledgeStats>;

    /// Dimension of the vectors already stored, if any
    async fn embedding_dimension(&self) -> Result<Option<usize>>;
}

/// Split text into lowercase alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Bank:Acme, Personal-Loan!"), vec!["bank", "acme", "personal", "loan"]);
        assert!(tokenize("  ,;  ").is_empty());
        assert_eq!(tokenize("招商银行 信用卡"), vec!["招商银行", "信用卡"]);
    }

    #[test]
    fn test_update_is_empty() {
        assert!(KnowledgeUpdate::default().is_empty());
        let update = KnowledgeUpdate {
            title: Some("t".into()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}

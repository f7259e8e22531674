//! Process-local knowledge store
//!
//! Keeps entries in a map behind an async RwLock. Used for ephemeral runs
//! and as the reference implementation in tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use super::embeddings::cosine_distance;
use super::{
    KnowledgeEntry, KnowledgeId, KnowledgeStats, KnowledgeStore, KnowledgeUpdate, Neighbor,
    NewKnowledge,
};
use crate::error::Result;

/// In-memory knowledge store
pub struct InMemoryKnowledgeStore {
    entries: RwLock<BTreeMap<KnowledgeId, KnowledgeEntry>>,
    next_id: AtomicI64,
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

fn category_matches(entry: &KnowledgeEntry, category: Option<&str>) -> bool {
    category.map_or(true, |c| entry.category == c)
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn insert(&self, entry: NewKnowledge) -> Result<KnowledgeEntry> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let stored = KnowledgeEntry {
            id,
            category: entry.category,
            title: entry.title,
            content: entry.content,
            embedding: entry.embedding,
            metadata: entry.metadata,
            created_at: now,
            updated_at: now,
        };
        self.entries.write().await.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: KnowledgeId) -> Result<Option<KnowledgeEntry>> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn update(&self, id: KnowledgeId, update: KnowledgeUpdate) -> Result<Option<KnowledgeEntry>> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&id) else {
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

        Ok(Some(entry.clone()))
    }

    async fn delete(&self, id: KnowledgeId) -> Result<bool> {
        Ok(self.entries.write().await.remove(&id).is_some())
    }

    async fn nearest_neighbor(
        &self,
        vector: &[f32],
        category: Option<&str>,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let entries = self.entries.read().await;
        let mut neighbors: Vec<Neighbor> = entries
            .values()
            .filter(|e| category_matches(e, category))
            .filter_map(|e| {
                e.embedding.as_ref().map(|emb| Neighbor {
                    id: e.id,
                    distance: cosine_distance(vector, emb),
                })
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
        let query = query.trim().to_lowercase();
        let entries = self.entries.read().await;

        let mut matches: Vec<(bool, &KnowledgeEntry)> = entries
            .values()
            .filter(|e| category_matches(e, category))
            .filter_map(|e| {
                let text = e.searchable_text().to_lowercase();
                let exact = !query.is_empty() && text.contains(&query);
                if exact || tokens.iter().any(|t| text.contains(t.as_str())) {
                    Some((exact, e))
                } else {
                    None
                }
            })
            .collect();

        matches.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.id.cmp(&a.1.id)));
        Ok(matches.into_iter().take(limit).map(|(_, e)| e.clone()).collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn stats(&self) -> Result<KnowledgeStats> {
        let entries = self.entries.read().await;
        let mut stats = KnowledgeStats {
            total_entries: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.embedding.is_some() {
                stats.embedded_entries += 1;
            }
            *stats.by_category.entry(entry.category.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .find_map(|e| e.embedding.as_ref().map(Vec::len)))
    }
}

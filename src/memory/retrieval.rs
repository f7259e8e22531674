//! Hybrid (vector + lexical) retrieval over the knowledge store

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    tokenize, CacheLayer, EmbeddingProvider, KnowledgeEntry, KnowledgeId, KnowledgeStats,
    KnowledgeStore, KnowledgeUpdate, Metadata, NewKnowledge,
};
use crate::config::SearchConfig;
use crate::error::{KnowledgeError, Result};

/// Upper bound on entries scanned for lexical matches per query
const LEXICAL_SCAN_LIMIT: usize = 500;

/// Cache key namespace for search results
const SEARCH_KEY_PREFIX: &str = "search:";

/// Retrieval strategy for a search call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Lexical,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vector" => Ok(SearchMode::Vector),
            "lexical" | "text" => Ok(SearchMode::Lexical),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(KnowledgeError::InvalidInput(format!("unknown search mode '{}'", other))),
        }
    }
}

/// Which scoring path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Vector,
    Lexical,
    Hybrid,
}

/// A ranked hit; `knowledge_id` is a lookup key only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub knowledge_id: KnowledgeId,
    /// Relevance in [0, 1]
    pub score: f32,
    pub source: ResultSource,
}

/// Parameters of one search call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub category: Option<String>,
    pub max_results: usize,
    pub mode: SearchMode,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            category: None,
            max_results: 5,
            mode: SearchMode::Hybrid,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Cache key: hash of query, category, result count and mode
    pub fn cache_key(&self) -> String {
        let material = serde_json::to_vec(&(&self.query, &self.category, self.max_results, self.mode))
            .unwrap_or_else(|_| self.query.as_bytes().to_vec());
        let digest = Sha256::digest(&material);
        format!("{}{}", SEARCH_KEY_PREFIX, hex::encode(digest))
    }
}

/// Search engine combining vector similarity with lexical matching,
/// fronted by a result cache
pub struct HybridSearchEngine {
    store: Arc<dyn KnowledgeStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cache: Arc<CacheLayer>,
    config: SearchConfig,
    cache_ttl: Duration,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        cache: Arc<CacheLayer>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            cache,
            config,
            cache_ttl: Duration::from_secs(3600),
        }
    }

    /// Override the TTL applied to cached result lists
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Embed text, treating any backend failure as "no vector"
    async fn try_embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Embedding via {} failed: {}", embedder.name(), e);
                None
            }
        }
    }

    /// Persist a new entry and return its id
    ///
    /// The entry is stored without a vector when embedding fails; it stays
    /// reachable through lexical search. Cached search results are left as
    /// they are.
    pub async fn add_knowledge(
        &self,
        category: &str,
        title: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<KnowledgeId> {
        if content.trim().is_empty() {
            return Err(KnowledgeError::InvalidInput("content must not be empty".to_string()));
        }

        let embedding = self.try_embed(&format!("{}\n{}", title, content)).await;
        let entry = self
            .store
            .insert(NewKnowledge {
                category: category.to_string(),
                title: title.to_string(),
                content: content.to_string(),
                embedding,
                metadata,
            })
            .await?;

        debug!(
            "Stored knowledge {} in '{}' ({})",
            entry.id,
            entry.category,
            if entry.embedding.is_some() { "embedded" } else { "lexical only" }
        );
        Ok(entry.id)
    }

    pub async fn get_knowledge(&self, id: KnowledgeId) -> Result<KnowledgeEntry> {
        self.store.get(id).await?.ok_or(KnowledgeError::NotFound(id))
    }

    /// Apply a partial update, re-embedding when title or content change
    pub async fn update_knowledge(&self, id: KnowledgeId, mut update: KnowledgeUpdate) -> Result<KnowledgeEntry> {
        if update.is_empty() {
            return Err(KnowledgeError::InvalidInput("update changes nothing".to_string()));
        }
        if update.content.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(KnowledgeError::InvalidInput("content must not be empty".to_string()));
        }

        if update.embedding.is_none() && (update.title.is_some() || update.content.is_some()) {
            let current = self.get_knowledge(id).await?;
            let title = update.title.as_deref().unwrap_or(&current.title);
            let content = update.content.as_deref().unwrap_or(&current.content);
            // A stale vector would rank the new text by the old meaning
            update.embedding = Some(self.try_embed(&format!("{}\n{}", title, content)).await);
        }

        self.store.update(id, update).await?.ok_or(KnowledgeError::NotFound(id))
    }

    /// Remove an entry; only ever called on explicit external request
    pub async fn delete_knowledge(&self, id: KnowledgeId) -> Result<()> {
        if self.store.delete(id).await? {
            Ok(())
        } else {
            Err(KnowledgeError::NotFound(id))
        }
    }

    pub async fn stats(&self) -> Result<KnowledgeStats> {
        self.store.stats().await
    }

    /// Drop every cached search result, returning how many were removed
    pub async fn invalidate_search_cache(&self) -> usize {
        self.cache.clear_prefix(SEARCH_KEY_PREFIX).await
    }

    /// Ranked retrieval
    ///
    /// Results are ordered by score descending, then id descending. Store
    /// failures are returned to the caller and never cached; cache failures
    /// only cost a store round trip.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        if request.query.trim().is_empty() {
            return Err(KnowledgeError::InvalidInput("query must not be empty".to_string()));
        }
        if request.max_results == 0 {
            return Ok(Vec::new());
        }

        let key = request.cache_key();
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_str::<Vec<SearchResult>>(&cached) {
                Ok(results) => {
                    debug!("Search cache hit for '{}'", request.query);
                    return Ok(results);
                }
                Err(e) => warn!("Discarding unreadable cached results for {}: {}", key, e),
            }
        }

        let category = request.category.as_deref();
        let results = match request.mode {
            SearchMode::Lexical => self.lexical_search(&request.query, category, request.max_results).await?,
            SearchMode::Vector => match self.try_embed(&request.query).await {
                Some(vector) => {
                    self.vector_search(&vector, category, request.max_results).await?
                }
                None => {
                    warn!("Query embedding unavailable, falling back to lexical search");
                    self.lexical_search(&request.query, category, request.max_results).await?
                }
            },
            SearchMode::Hybrid => match self.try_embed(&request.query).await {
                Some(vector) => {
                    self.hybrid_search(&request.query, &vector, category, request.max_results).await?
                }
                None => {
                    warn!("Query embedding unavailable, falling back to lexical search");
                    self.lexical_search(&request.query, category, request.max_results).await?
                }
            },
        };

        match serde_json::to_string(&results) {
            Ok(json) => {
                self.cache.set(&key, &json, Some(self.cache_ttl)).await;
            }
            Err(e) => warn!("Could not serialize search results for caching: {}", e),
        }

        Ok(results)
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        category: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let neighbors = self.store.nearest_neighbor(vector, category, max_results).await?;

        let mut results: Vec<SearchResult> = neighbors
            .into_iter()
            .map(|n| SearchResult {
                knowledge_id: n.id,
                score: similarity(n.distance),
                source: ResultSource::Vector,
            })
            .filter(|r| r.score >= self.config.similarity_threshold)
            .collect();

        rank(&mut results, max_results);
        Ok(results)
    }

    async fn lexical_search(
        &self,
        query: &str,
        category: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut results: Vec<SearchResult> = self
            .lexical_scores(query, category)
            .await?
            .into_iter()
            .map(|(id, score)| SearchResult {
                knowledge_id: id,
                score,
                source: ResultSource::Lexical,
            })
            .collect();

        rank(&mut results, max_results);
        Ok(results)
    }

    async fn hybrid_search(
        &self,
        query: &str,
        vector: &[f32],
        category: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let k = max_results.saturating_mul(self.config.candidate_multiplier.max(1));
        let neighbors = self.store.nearest_neighbor(vector, category, k).await?;

        // id -> (vector similarity, lexical score)
        let mut combined: HashMap<KnowledgeId, (f32, f32)> = HashMap::new();
        for neighbor in neighbors {
            let sim = similarity(neighbor.distance);
            if sim >= self.config.best_effort_threshold {
                combined.entry(neighbor.id).or_default().0 = sim;
            }
        }
        for (id, lexical) in self.lexical_scores(query, category).await? {
            combined.entry(id).or_default().1 = lexical;
        }

        let alpha = self.config.alpha;
        let mut results: Vec<SearchResult> = combined
            .into_iter()
            .map(|(id, (sim, lexical))| SearchResult {
                knowledge_id: id,
                score: (alpha * sim + (1.0 - alpha) * lexical).clamp(0.0, 1.0),
                source: ResultSource::Hybrid,
            })
            .filter(|r| r.score > 0.0)
            .collect();

        rank(&mut results, max_results);
        Ok(results)
    }

    async fn lexical_scores(&self, query: &str, category: Option<&str>) -> Result<Vec<(KnowledgeId, f32)>> {
        let query_lower = query.trim().to_lowercase();
        let tokens = tokenize(query);
        let candidates = self
            .store
            .lexical_candidates(query, &tokens, category, LEXICAL_SCAN_LIMIT)
            .await?;

        Ok(candidates
            .iter()
            .map(|entry| (entry.id, lexical_score(entry, &query_lower, &tokens)))
            .filter(|(_, score)| *score > 0.0)
            .collect())
    }
}

/// Map cosine distance to a similarity in [0, 1]
fn similarity(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// 1.0 when the entry contains the whole query, 0.5 when it shares a
/// token with it, 0.0 otherwise
fn lexical_score(entry: &KnowledgeEntry, query_lower: &str, tokens: &[String]) -> f32 {
    let text = entry.searchable_text().to_lowercase();
    if !query_lower.is_empty() && text.contains(query_lower) {
        1.0
    } else if tokens.iter().any(|t| text.contains(t.as_str())) {
        0.5
    } else {
        0.0
    }
}

/// Sort by score descending then id descending, keep the top `max_results`
fn rank(results: &mut Vec<SearchResult>, max_results: usize) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.knowledge_id.cmp(&a.knowledge_id))
    });
    results.truncate(max_results);
}

//! Search engine behaviour across store, cache and embedder

use async_trait::async_trait;
use knowledge_engine::config::{CacheConfig, Config, SearchConfig};
use knowledge_engine::learning::TemplateContentGenerator;
use knowledge_engine::memory::{
    CacheLayer, EmbeddingConfig, EmbeddingModel, HybridSearchEngine, InMemoryKnowledgeStore,
    KnowledgeEntry, KnowledgeId, KnowledgeStats, KnowledgeStore, KnowledgeUpdate, Metadata,
    Neighbor, NewKnowledge, ResultSource, SqliteKnowledgeStore,
};
use knowledge_engine::{EngineContext, KnowledgeError, Result, SearchMode, SearchRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates to an in-memory store and counts search queries
#[derive(Default)]
struct CountingStore {
    inner: InMemoryKnowledgeStore,
    queries: AtomicUsize,
}

impl CountingStore {
    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeStore for CountingStore {
    async fn insert(&self, entry: NewKnowledge) -> Result<KnowledgeEntry> {
        self.inner.insert(entry).await
    }

    async fn get(&self, id: KnowledgeId) -> Result<Option<KnowledgeEntry>> {
        self.inner.get(id).await
    }

    async fn update(&self, id: KnowledgeId, update: KnowledgeUpdate) -> Result<Option<KnowledgeEntry>> {
        self.inner.update(id, update).await
    }

    async fn delete(&self, id: KnowledgeId) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn nearest_neighbor(&self, vector: &[f32], category: Option<&str>, k: usize) -> Result<Vec<Neighbor>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.nearest_neighbor(vector, category, k).await
    }

    async fn lexical_candidates(
        &self,
        query: &str,
        tokens: &[String],
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.lexical_candidates(query, tokens, category, limit).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn stats(&self) -> Result<KnowledgeStats> {
        self.inner.stats().await
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        self.inner.embedding_dimension().await
    }
}

/// Store whose every operation fails
struct DownStore;

#[async_trait]
impl KnowledgeStore for DownStore {
    async fn insert(&self, _entry: NewKnowledge) -> Result<KnowledgeEntry> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn get(&self, _id: KnowledgeId) -> Result<Option<KnowledgeEntry>> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn update(&self, _id: KnowledgeId, _update: KnowledgeUpdate) -> Result<Option<KnowledgeEntry>> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn delete(&self, _id: KnowledgeId) -> Result<bool> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn nearest_neighbor(&self, _vector: &[f32], _category: Option<&str>, _k: usize) -> Result<Vec<Neighbor>> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn lexical_candidates(
        &self,
        _query: &str,
        _tokens: &[String],
        _category: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn count(&self) -> Result<usize> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn stats(&self) -> Result<KnowledgeStats> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }

    async fn embedding_dimension(&self) -> Result<Option<usize>> {
        Err(KnowledgeError::StoreUnavailable("down".into()))
    }
}

fn lexical_engine(store: Arc<dyn KnowledgeStore>) -> HybridSearchEngine {
    HybridSearchEngine::new(
        store,
        None,
        Arc::new(CacheLayer::local(&CacheConfig::default())),
        SearchConfig::default(),
    )
}

#[tokio::test]
async fn test_repeated_search_served_from_cache() {
    let store = Arc::new(CountingStore::default());
    let engine = lexical_engine(store.clone());
    engine
        .add_knowledge("product_info", "Home loan", "Fixed rate home loan over 30 years", Metadata::new())
        .await
        .unwrap();

    let request = SearchRequest::new("home loan").mode(SearchMode::Lexical);
    let first = engine.search(&request).await.unwrap();
    let second = engine.search(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].source, ResultSource::Lexical);
    assert_eq!(store.queries(), 1);

    // a different category is a different cache entry
    engine.search(&request.clone().category("bank_info")).await.unwrap();
    assert_eq!(store.queries(), 2);
}

#[tokio::test]
async fn test_invalidation_exposes_new_entries() {
    let store = Arc::new(CountingStore::default());
    let engine = lexical_engine(store.clone());
    let request = SearchRequest::new("Borealis Trust").mode(SearchMode::Lexical);

    assert!(engine.search(&request).await.unwrap().is_empty());
    let id = engine
        .add_knowledge("bank_info", "Borealis Trust", "Borealis Trust offers car loans", Metadata::new())
        .await
        .unwrap();
    assert!(engine.search(&request).await.unwrap().is_empty());

    assert!(engine.invalidate_search_cache().await >= 1);
    let results = engine.search(&request).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].knowledge_id, id);
    assert_eq!(results[0].score, 1.0);
}

#[tokio::test]
async fn test_store_failure_is_reported_and_not_cached() {
    let engine = lexical_engine(Arc::new(DownStore));
    let request = SearchRequest::new("anything");

    for _ in 0..2 {
        match engine.search(&request).await {
            Err(KnowledgeError::StoreUnavailable(_)) => {}
            other => panic!("expected store failure, got {:?}", other),
        }
    }
    assert_eq!(engine.cache().stats().await.entries, Some(0));
}

#[tokio::test]
async fn test_hybrid_search_over_sqlite_with_hash_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteKnowledgeStore::new(&dir.path().join("knowledge.db")).await.unwrap());

    let mut config = Config::default();
    config.embedding = EmbeddingConfig::hash(256);
    let embedder = EmbeddingModel::from_config(&config.embedding).unwrap();
    let ctx = EngineContext::assemble(config, store, embedder, None, Arc::new(TemplateContentGenerator))
        .await
        .unwrap();

    let acme = ctx
        .engine
        .add_knowledge("bank_info", "Acme Savings", "Acme Savings offers fixed deposits", Metadata::new())
        .await
        .unwrap();
    ctx.engine
        .add_knowledge("bank_info", "Borealis Trust", "Borealis Trust issues travel cards", Metadata::new())
        .await
        .unwrap();

    let results = ctx.engine.search(&SearchRequest::new("fixed deposit")).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].knowledge_id, acme);
    assert_eq!(results[0].source, ResultSource::Hybrid);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let entry = ctx.engine.get_knowledge(acme).await.unwrap();
    assert_eq!(entry.embedding.map(|v| v.len()), Some(256));

    ctx.engine.delete_knowledge(acme).await.unwrap();
    assert!(matches!(ctx.engine.get_knowledge(acme).await, Err(KnowledgeError::NotFound(id)) if id == acme));
}

#[tokio::test]
async fn test_sqlite_and_in_memory_agree_on_non_ascii_case() {
    let stores: Vec<Arc<dyn KnowledgeStore>> = vec![
        Arc::new(SqliteKnowledgeStore::open_in_memory().unwrap()),
        Arc::new(InMemoryKnowledgeStore::new()),
    ];

    for store in stores {
        let engine = lexical_engine(store);
        let id = engine
            .add_knowledge("bank_info", "ÖKOBANK", "ÖKOBANK", Metadata::new())
            .await
            .unwrap();

        let results = engine
            .search(&SearchRequest::new("ökobank").mode(SearchMode::Lexical))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].knowledge_id, id);
        assert_eq!(results[0].score, 1.0);
    }
}

//! Process-wide engine context
//!
//! Built once at startup and passed to whoever needs the engine; there are
//! no global singletons.

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{KnowledgeError, Result};
use crate::learning::{ContentGenerator, LearningController, TieredContentGenerator};
use crate::memory::{
    CacheLayer, EmbeddingModel, EmbeddingProvider, HybridSearchEngine, InMemoryKnowledgeStore,
    KnowledgeStore, RedisCache, SharedCache, SqliteKnowledgeStore,
};

/// Shared engine components
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn KnowledgeStore>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub cache: Arc<CacheLayer>,
    pub engine: Arc<HybridSearchEngine>,
    pub generator: Arc<dyn ContentGenerator>,
}

impl EngineContext {
    /// Build every component from configuration
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn KnowledgeStore> = if config.store.in_memory {
            Arc::new(InMemoryKnowledgeStore::new())
        } else {
            let path = config
                .store
                .resolved_path()
                .map_err(|e| KnowledgeError::Configuration(format!("database path: {:#}", e)))?;
            info!("Opening knowledge store at {}", path.display());
            Arc::new(SqliteKnowledgeStore::new(&path).await?)
        };

        let embedder = EmbeddingModel::from_config(&config.embedding)?;
        let generator: Arc<dyn ContentGenerator> = Arc::new(TieredContentGenerator::from_config(&config.generator)?);

        let shared_cache = match &config.cache.url {
            Some(url) => Some(Arc::new(RedisCache::open(url, config.cache.connect_timeout())?) as Arc<dyn SharedCache>),
            None => None,
        };

        Self::assemble(config, store, embedder, shared_cache, generator).await
    }

    /// Wire explicitly supplied components together
    ///
    /// Fails with a configuration error when the embedder's dimension does
    /// not match the configured one or the vectors already in the store.
    pub async fn assemble(
        config: Config,
        store: Arc<dyn KnowledgeStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        shared_cache: Option<Arc<dyn SharedCache>>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<Self> {
        config.validate()?;

        if let Some(embedder) = &embedder {
            check_dimension(embedder.as_ref(), config.embedding.dimension, store.as_ref()).await?;
        }

        let cache = Arc::new(CacheLayer::connect(shared_cache, &config.cache).await);
        let engine = Arc::new(
            HybridSearchEngine::new(store.clone(), embedder.clone(), cache.clone(), config.search.clone())
                .with_cache_ttl(config.cache.default_ttl()),
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            embedder,
            cache,
            engine,
            generator,
        })
    }

    /// A fresh learning controller over this context's engine
    pub fn controller(&self) -> LearningController {
        LearningController::new(self.engine.clone(), self.generator.clone(), self.config.learning.clone())
    }
}

async fn check_dimension(
    embedder: &dyn EmbeddingProvider,
    configured: usize,
    store: &dyn KnowledgeStore,
) -> Result<()> {
    let dimension = embedder.dimension();
    if dimension != configured {
        return Err(KnowledgeError::Configuration(format!(
            "embedder {} produces {}-dimensional vectors but {} are configured",
            embedder.name(), dimension, configured
        )));
    }

    if let Some(stored) = store.embedding_dimension().await? {
        if stored != dimension {
            return Err(KnowledgeError::Configuration(format!(
                "store holds {}-dimensional vectors but embedder {} produces {}",
                stored, embedder.name(), dimension
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::TemplateContentGenerator;
    use crate::memory::embeddings::EmbeddingConfig;
    use crate::memory::NewKnowledge;

    fn in_memory_config(dimension: usize) -> Config {
        let mut config = Config::default();
        config.store.in_memory = true;
        config.embedding = EmbeddingConfig::hash(dimension);
        config
    }

    #[tokio::test]
    async fn test_build_in_memory_with_hash_embeddings() {
        let ctx = EngineContext::build(in_memory_config(64)).await.unwrap();
        assert_eq!(ctx.embedder.as_ref().map(|e| e.dimension()), Some(64));
        assert_eq!(ctx.cache.backend_name(), "local");

        let id = ctx
            .engine
            .add_knowledge("bank_info", "Acme", "Acme Savings offers fixed deposits", Default::default())
            .await
            .unwrap();
        assert_eq!(ctx.store.get(id).await.unwrap().unwrap().embedding.map(|v| v.len()), Some(64));
    }

    #[tokio::test]
    async fn test_stored_dimension_mismatch_is_fatal() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        store
            .insert(NewKnowledge {
                category: "c".into(),
                title: "t".into(),
                content: "x".into(),
                embedding: Some(vec![0.0; 8]),
                ..Default::default()
            })
            .await
            .unwrap();

        let config = in_memory_config(16);
        let embedder = EmbeddingModel::from_config(&config.embedding).unwrap();
        let result = EngineContext::assemble(config, store, embedder, None, Arc::new(TemplateContentGenerator)).await;
        assert!(matches!(result, Err(KnowledgeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_configured_cache_url_unreachable_degrades_to_local() {
        let mut config = in_memory_config(16);
        config.cache.url = Some("redis://127.0.0.1:1/".to_string());
        config.cache.connect_timeout_secs = 0.5;

        let ctx = EngineContext::build(config).await.unwrap();
        assert_eq!(ctx.cache.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_malformed_cache_url_rejected() {
        let mut config = in_memory_config(16);
        config.cache.url = Some("not a url".to_string());
        assert!(matches!(EngineContext::build(config).await, Err(KnowledgeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = in_memory_config(16);
        config.search.alpha = 2.0;
        assert!(matches!(EngineContext::build(config).await, Err(KnowledgeError::Configuration(_))));
    }
}

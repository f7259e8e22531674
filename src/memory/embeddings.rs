//! Embedding backends
//!
//! Supports:
//! - OpenRouter embeddings
//! - OpenAI embeddings directly
//! - Hash-based feature vectors (offline, deterministic, lower quality)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{KnowledgeError, Result};

/// Text to fixed-dimension vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Human-readable backend name
    fn name(&self) -> &str {
        "embedding"
    }
}

/// Available embedding backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenRouter (OpenAI-compatible embeddings endpoint)
    #[default]
    OpenRouter,
    /// OpenAI directly
    OpenAi,
    /// Local hash-based vectors (no network)
    Hash,
    /// No embeddings; the store is searched lexically only
    Disabled,
}

impl std::fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenRouter => write!(f, "OpenRouter"),
            Self::OpenAi => write!(f, "OpenAI"),
            Self::Hash => write!(f, "Hash"),
            Self::Disabled => write!(f, "Disabled"),
        }
    }
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend
    #[serde(default)]
    pub backend: EmbeddingBackend,
    /// Model name (backend-specific)
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// API key; when absent the `api_key_env` variable is consulted
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Maximum input length in tokens (roughly 4 chars each)
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Embedding dimension, constant for the lifetime of a store
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Memoised embeddings kept in process
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: usize,
}

fn default_model_name() -> String {
    "openai/text-embedding-3-small".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_max_length() -> usize {
    8191
}

fn default_dimension() -> usize {
    1536
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_memo_capacity() -> usize {
    1000
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::OpenRouter,
            model_name: default_model_name(),
            api_key: None,
            api_key_env: default_api_key_env(),
            max_length: default_max_length(),
            dimension: default_dimension(),
            timeout_secs: default_timeout_secs(),
            memo_capacity: default_memo_capacity(),
        }
    }
}

impl EmbeddingConfig {
    /// Create config for OpenAI directly
    pub fn openai(api_key: String) -> Self {
        Self {
            backend: EmbeddingBackend::OpenAi,
            model_name: "text-embedding-3-small".to_string(),
            api_key: Some(api_key),
            api_key_env: "OPENAI_API_KEY".to_string(),
            ..Default::default()
        }
    }

    /// Create config for hash-based vectors
    pub fn hash(dimension: usize) -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            model_name: "hash-based".to_string(),
            api_key: None,
            dimension,
            max_length: 512,
            ..Default::default()
        }
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Embedding model wrapper supporting multiple backends
pub struct EmbeddingModel {
    config: EmbeddingConfig,
    client: Client,
    /// Recently computed embeddings
    memo: Mutex<lru::LruCache<String, Vec<f32>>>,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given configuration
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(KnowledgeError::Configuration(
                "embedding dimension must be positive".to_string(),
            ));
        }

        info!("Initializing embedding model: {} ({})", config.model_name, config.backend);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KnowledgeError::Configuration(format!("HTTP client: {}", e)))?;

        let capacity = NonZeroUsize::new(config.memo_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            client,
            memo: Mutex::new(lru::LruCache::new(capacity)),
        })
    }

    /// Build the provider described by the config.
    ///
    /// Returns `None` when embeddings are disabled. API backends without a
    /// key fall back to hash-based vectors of the same dimension.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
        let mut config = config.clone();
        match config.backend {
            EmbeddingBackend::Disabled => return Ok(None),
            EmbeddingBackend::OpenRouter | EmbeddingBackend::OpenAi => {
                match config.resolve_api_key() {
                    Some(key) => config.api_key = Some(key),
                    None => {
                        warn!(
                            "No API key in {} for embeddings, using hash-based fallback",
                            config.api_key_env
                        );
                        config = EmbeddingConfig::hash(config.dimension);
                    }
                }
            }
            EmbeddingBackend::Hash => {}
        }
        Ok(Some(Arc::new(Self::new(config)?)))
    }

    /// Generate embedding via OpenAI/OpenRouter API
    async fn embed_via_api(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self.config.api_key.as_ref()
            .ok_or_else(|| KnowledgeError::EmbeddingUnavailable("API key not configured".to_string()))?;

        let text = self.truncate_text(text);

        let request = EmbeddingRequest {
            model: self.config.model_name.clone(),
            input: vec![text.to_string()],
        };

        let (url, headers) = match self.config.backend {
            EmbeddingBackend::OpenRouter => {
                let headers = vec![
                    ("Authorization", format!("Bearer {}", api_key)),
                    ("HTTP-Referer", "https://github.com/knowledge-engine".to_string()),
                    ("X-Title", "knowledge-engine".to_string()),
                ];
                ("https://openrouter.ai/api/v1/embeddings", headers)
            }
            EmbeddingBackend::OpenAi => {
                let headers = vec![("Authorization", format!("Bearer {}", api_key))];
                ("https://api.openai.com/v1/embeddings", headers)
            }
            _ => {
                return Err(KnowledgeError::EmbeddingUnavailable(
                    "invalid backend for API embeddings".to_string(),
                ))
            }
        };

        let mut req = self.client.post(url);
        for (key, value) in headers {
            req = req.header(key, value);
        }

        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| KnowledgeError::EmbeddingUnavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!("Embedding API error ({}): {}", status, error_text);
            return Err(KnowledgeError::EmbeddingUnavailable(format!(
                "API returned {}: {}", status, error_text
            )));
        }

        let result: EmbeddingResponse = response.json().await
            .map_err(|e| KnowledgeError::EmbeddingUnavailable(format!("bad response: {}", e)))?;

        result.data.into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| KnowledgeError::EmbeddingUnavailable("no embedding in response".to_string()))
    }

    /// Truncate text to maximum length on a char boundary
    fn truncate_text<'a>(&self, text: &'a str) -> &'a str {
        let max_chars = self.config.max_length * 4;
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn backend(&self) -> &EmbeddingBackend {
        &self.config.backend
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut memo = self.memo.lock().await;
            if let Some(cached) = memo.get(text) {
                return Ok(cached.clone());
            }
        }

        let embedding = match self.config.backend {
            EmbeddingBackend::OpenRouter | EmbeddingBackend::OpenAi => self.embed_via_api(text).await?,
            EmbeddingBackend::Hash => hash_embedding(text, self.config.dimension),
            EmbeddingBackend::Disabled => {
                return Err(KnowledgeError::EmbeddingUnavailable("embeddings disabled".to_string()))
            }
        };

        if embedding.len() != self.config.dimension {
            return Err(KnowledgeError::Configuration(format!(
                "embedding backend returned {} dimensions, expected {}",
                embedding.len(),
                self.config.dimension
            )));
        }

        self.memo.lock().await.put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}

/// Feature-hashed bag of tokens, L2-normalised.
///
/// Shared tokens produce positive similarity, so the vectors are usable for
/// ranking even without a model. Non-ASCII tokens also contribute each
/// character, which keeps unsegmented CJK text comparable.
pub fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dim];
    if dim == 0 {
        return embedding;
    }

    let mut add_feature = |feature: &str| {
        let digest = Sha256::digest(feature.as_bytes());
        let idx = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3],
            digest[4], digest[5], digest[6], digest[7],
        ]) as usize % dim;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        embedding[idx] += sign;
    };

    for token in super::tokenize(text) {
        add_feature(&token);
        if !token.is_ascii() {
            let mut buf = [0u8; 4];
            for ch in token.chars() {
                add_feature(ch.encode_utf8(&mut buf));
            }
        }
    }

    let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag > 0.0 {
        for val in embedding.iter_mut() {
            *val /= mag;
        }
    }
    embedding
}

/// OpenAI embedding request
#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

/// OpenAI embedding response
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Cosine distance, the quantity nearest-neighbour queries rank by
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedding_model() {
        let model = EmbeddingModel::new(EmbeddingConfig::hash(64)).unwrap();

        let emb1 = model.embed("hello world").await.unwrap();
        let emb2 = model.embed("hello world").await.unwrap();
        let emb3 = model.embed("goodbye moon").await.unwrap();

        assert_eq!(emb1, emb2);
        assert_ne!(emb1, emb3);
        assert_eq!(emb1.len(), 64);

        let mag: f32 = emb1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_hash_embedding_shares_tokens() {
        let a = hash_embedding("personal credit loan", 256);
        let b = hash_embedding("credit loan rates", 256);
        let c = hash_embedding("weather forecast tomorrow", 256);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.001);
        assert!((cosine_distance(&a, &c) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_disabled_backend_builds_no_provider() {
        let config = EmbeddingConfig {
            backend: EmbeddingBackend::Disabled,
            ..Default::default()
        };
        assert!(EmbeddingModel::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_falls_back_to_hash() {
        let config = EmbeddingConfig {
            api_key_env: "KNOWLEDGE_ENGINE_TEST_UNSET_KEY".to_string(),
            dimension: 32,
            ..Default::default()
        };
        let provider = EmbeddingModel::from_config(&config).unwrap().unwrap();
        assert_eq!(provider.dimension(), 32);
        assert_eq!(provider.name(), "hash-based");
    }
}

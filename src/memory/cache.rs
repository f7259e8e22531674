//! TTL cache in front of the search engine
//!
//! `CacheLayer` talks to a shared cache service when one is reachable at
//! startup and otherwise keeps entries in a process-local LRU. Callers never
//! see cache errors: a failing backend is logged and treated as a miss.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;

/// A cache service shared between processes (e.g. a key-value server)
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Backend name for logs and stats
    fn name(&self) -> &str;

    /// Check the service is reachable
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every key starting with `prefix`, returning how many went
    async fn clear_prefix(&self, prefix: &str) -> Result<usize>;
}

/// A cached value in the local backend
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local LRU cache with lazy expiry
pub struct LocalCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if entries.peek(key).is_some_and(|e| e.is_expired(now)) {
            entries.pop(key);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(entry.value.clone())
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: now + ttl,
            access_count: 0,
            last_accessed: now,
        };
        self.entries.lock().await.put(key.to_string(), entry);
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.pop(key).is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.peek(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.pop(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn clear_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Number of live entries; expired ones are dropped on the way
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        entries.len()
    }
}

enum Backend {
    Shared(Arc<dyn SharedCache>),
    Local(LocalCache),
}

/// Cache statistics snapshot
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    /// Live entries; only known for the local backend
    pub entries: Option<usize>,
}

/// Key-value cache with TTL, shared when possible and local otherwise
pub struct CacheLayer {
    backend: Backend,
    key_prefix: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheLayer {
    /// Choose a backend: the shared cache if it answers a ping, else local
    pub async fn connect(shared: Option<Arc<dyn SharedCache>>, config: &CacheConfig) -> Self {
        let backend = match shared {
            Some(shared) => match shared.ping().await {
                Ok(()) => {
                    debug!("Using shared cache backend '{}'", shared.name());
                    Backend::Shared(shared)
                }
                Err(e) => {
                    warn!("Shared cache '{}' unreachable, using local cache: {}", shared.name(), e);
                    Backend::Local(LocalCache::new(config.local_max_entries))
                }
            },
            None => Backend::Local(LocalCache::new(config.local_max_entries)),
        };

        Self {
            backend,
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Local-only cache layer
    pub fn local(config: &CacheConfig) -> Self {
        Self {
            backend: Backend::Local(LocalCache::new(config.local_max_entries)),
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub fn backend_name(&self) -> &str {
        match &self.backend {
            Backend::Shared(shared) => shared.name(),
            Backend::Local(_) => "local",
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let key = self.full_key(key);
        let value = match &self.backend {
            Backend::Shared(shared) => shared.get(&key).await.unwrap_or_else(|e| {
                warn!("Cache get failed for {}: {}", key, e);
                None
            }),
            Backend::Local(local) => local.get(&key).await,
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store a value; `ttl` of `None` uses the configured default.
    /// Returns whether the value was stored.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let key = self.full_key(key);
        let ttl = ttl.unwrap_or(self.default_ttl);
        match &self.backend {
            Backend::Shared(shared) => match shared.set(&key, value, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Cache set failed for {}: {}", key, e);
                    false
                }
            },
            Backend::Local(local) => {
                local.set(&key, value, ttl).await;
                true
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let key = self.full_key(key);
        match &self.backend {
            Backend::Shared(shared) => shared.delete(&key).await.unwrap_or_else(|e| {
                warn!("Cache delete failed for {}: {}", key, e);
                false
            }),
            Backend::Local(local) => local.delete(&key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let key = self.full_key(key);
        match &self.backend {
            Backend::Shared(shared) => shared.exists(&key).await.unwrap_or_else(|e| {
                warn!("Cache exists failed for {}: {}", key, e);
                false
            }),
            Backend::Local(local) => local.exists(&key).await,
        }
    }

    /// Remove all keys under `prefix` (relative to the layer's namespace)
    pub async fn clear_prefix(&self, prefix: &str) -> usize {
        let prefix = self.full_key(prefix);
        match &self.backend {
            Backend::Shared(shared) => shared.clear_prefix(&prefix).await.unwrap_or_else(|e| {
                warn!("Cache clear failed for {}*: {}", prefix, e);
                0
            }),
            Backend::Local(local) => local.clear_prefix(&prefix).await,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match &self.backend {
            Backend::Shared(_) => None,
            Backend::Local(local) => Some(local.len().await),
        };
        CacheStats {
            backend: self.backend_name().to_string(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

//! Redis-backed shared cache

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use super::cache::SharedCache;
use crate::error::{KnowledgeError, Result};

/// Keys fetched per SCAN round trip when clearing a prefix
const SCAN_BATCH: usize = 200;

/// Shared cache on a Redis server
///
/// The connection is opened on first use, so an unreachable server shows up
/// as a failed `ping` and `CacheLayer::connect` falls back to local.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
}

fn unavailable(e: redis::RedisError) -> KnowledgeError {
    KnowledgeError::CacheUnavailable(e.to_string())
}

impl RedisCache {
    /// Parse the URL; no connection is made yet
    pub fn open(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| KnowledgeError::Configuration(format!("cache url '{}': {}", url, e)))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            connect_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("Connecting to shared cache");
                match tokio::time::timeout(self.connect_timeout, ConnectionManager::new(self.client.clone())).await {
                    Ok(conn) => conn.map_err(unavailable),
                    Err(_) => Err(KnowledgeError::CacheUnavailable(format!(
                        "no answer within {:.1}s",
                        self.connect_timeout.as_secs_f64()
                    ))),
                }
            })
            .await?;
        Ok(conn.clone())
    }
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl SharedCache for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let millis = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: usize = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(key).await.map_err(unavailable)?;
        Ok(exists)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", glob_escape(prefix));

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(keys).await.map_err(unavailable)?;
        Ok(removed)
    }
}

//! Redis cache backend for multi-process deployments

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

/// Keys scanned per SCAN round during prefix invalidation
const SCAN_BATCH: usize = 200;

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Shared cache stored in Redis, every key namespaced
pub struct RedisCache {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    /// Connect to `url`; fails when the server is unreachable
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis cache at {}", url);

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced(&self.namespace, key)
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}{}", namespace, key)
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: usize = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.namespaced(prefix)));

        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("device:42:"), "device:42:");
        assert_eq!(escape_glob("a*b?c[d]e\\"), "a\\*b\\?c\\[d\\]e\\\\");
    }

    #[test]
    fn test_namespaced() {
        assert_eq!(namespaced("sensorhub:", "device:1:latest"), "sensorhub:device:1:latest");
    }

    // Live server tests: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

    const TTL: Duration = Duration::from_secs(60);

    /// Fresh namespace per test so runs never see each other's keys
    async fn live_cache() -> Option<RedisCache> {
        let url = std::env::var("REDIS_URL").ok()?;
        let namespace = format!("sensorhub-test:{}:", uuid::Uuid::new_v4());
        Some(RedisCache::connect(&url, &namespace).await.unwrap())
    }

    #[tokio::test]
    #[ignore = "needs REDIS_URL"]
    async fn test_live_get_set_overwrite() {
        let Some(cache) = live_cache().await else { return };

        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.set("k", b"1".to_vec(), TTL).await.unwrap();
        cache.set("k", b"2".to_vec(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"2".to_vec()));

        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "needs REDIS_URL"]
    async fn test_live_ttl_expiry() {
        let Some(cache) = live_cache().await else { return };

        cache.set("short", b"v".to_vec(), Duration::from_millis(150)).await.unwrap();
        cache.set("long", b"v".to_vec(), TTL).await.unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "needs REDIS_URL"]
    async fn test_live_invalidate_by_prefix_exact() {
        let Some(cache) = live_cache().await else { return };
        for key in [
            "device:42:latest",
            "device:42:history:10",
            "device:421:latest",
            "device:4:latest",
            "xdevice:42:latest",
            "device:[42]:latest",
        ] {
            cache.set(key, b"v".to_vec(), TTL).await.unwrap();
        }

        assert_eq!(cache.invalidate_by_prefix("device:42:").await.unwrap(), 2);
        assert_eq!(cache.get("device:42:latest").await.unwrap(), None);
        assert_eq!(cache.get("device:42:history:10").await.unwrap(), None);
        assert!(cache.get("device:421:latest").await.unwrap().is_some());
        assert!(cache.get("device:4:latest").await.unwrap().is_some());
        assert!(cache.get("xdevice:42:latest").await.unwrap().is_some());

        // Glob characters in the prefix match literally
        assert_eq!(cache.invalidate_by_prefix("device:[42]").await.unwrap(), 1);
        assert!(cache.get("device:4:latest").await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "needs REDIS_URL"]
    async fn test_live_namespaces_are_isolated() {
        let Some(a) = live_cache().await else { return };
        let Some(b) = live_cache().await else { return };

        a.set("device:1:latest", b"a".to_vec(), TTL).await.unwrap();
        assert_eq!(b.get("device:1:latest").await.unwrap(), None);
        assert_eq!(b.invalidate_by_prefix("device:").await.unwrap(), 0);
        assert_eq!(a.get("device:1:latest").await.unwrap(), Some(b"a".to_vec()));
    }
}

//! Prefixed key/value cache.
//!
//! A thin layer over the connection pair that applies an optional key prefix
//! and a default expiration. New code should prefer
//! [`crate::store::TaggedStore`], which supports group invalidation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::error;

use tagstore_core::{ConnectionPair, StoreResult};

use crate::health::{CacheStatusResult, HealthCheckResult};

/// Default expiration: 3 hours.
pub const DEFAULT_EXPIRATION_SECS: u64 = 60 * 60 * 3;

/// How long a cached entry lives. `Seconds(0)` behaves like `Never`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Seconds(u64),
    Never,
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Seconds(DEFAULT_EXPIRATION_SECS)
    }
}

impl Expiration {
    fn as_ttl(&self) -> Option<Duration> {
        match self {
            Expiration::Seconds(0) => None,
            Expiration::Seconds(secs) => Some(Duration::from_secs(*secs)),
            Expiration::Never => None,
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Prefix applied to every key, e.g. `"test."`.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheService {
    connections: ConnectionPair,
    key_prefix: String,
}

impl CacheService {
    pub fn new(connections: ConnectionPair, settings: &CacheSettings) -> Self {
        Self {
            connections,
            key_prefix: settings.key_prefix.clone().unwrap_or_default(),
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.prefixed(key);
        self.connections.read_only.get(&key).await.inspect_err(|e| {
            error!(key = %key, error = %e, "Failed to get cached value");
        })
    }

    pub async fn set(&self, key: &str, value: &str, expiration: Expiration) -> StoreResult<()> {
        let key = self.prefixed(key);
        self.connections
            .read_write
            .set(&key, value, expiration.as_ttl())
            .await
    }

    pub async fn keys_by_pattern(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.connections
            .read_only
            .keys(&self.prefixed(pattern))
            .await
    }

    pub async fn get_by_keys(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        self.connections.read_only.mget(&keys).await.inspect_err(|e| {
            error!(keys = keys.len(), error = %e, "Failed to get cached values by keys");
        })
    }

    pub async fn remove(&self, key: &str) -> StoreResult<u64> {
        self.connections
            .read_write
            .del(&[self.prefixed(key)])
            .await
    }

    pub fn health(&self) -> HealthCheckResult<CacheStatusResult> {
        let cache = self.connections.status();
        HealthCheckResult::new(cache.is_ready(), CacheStatusResult { cache })
    }

    pub async fn shutdown(&self) -> StoreResult<()> {
        self.connections.quit().await
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagstore_core::KeyValueConnection;
    use tagstore_memory::MemoryStore;

    fn cache(prefix: Option<&str>) -> (MemoryStore, CacheService) {
        let memory = MemoryStore::new();
        let settings = CacheSettings {
            key_prefix: prefix.map(str::to_string),
        };
        let cache = CacheService::new(memory.pair(), &settings);
        (memory, cache)
    }

    #[tokio::test]
    async fn test_prefix_is_applied() {
        let (memory, cache) = cache(Some("test."));
        cache.set("a", "1", Expiration::default()).await.unwrap();

        assert_eq!(
            memory.connection().get("test.a").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(
            cache.get_by_keys(&["a".to_string(), "b".to_string()]).await.unwrap(),
            vec![Some("1".to_string()), None]
        );
        assert_eq!(
            cache.keys_by_pattern("*").await.unwrap(),
            vec!["test.a".to_string()]
        );

        assert_eq!(cache.remove("a").await.unwrap(), 1);
        assert!(cache.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_prefix() {
        let (memory, cache) = cache(None);
        cache.set("a", "1", Expiration::Never).await.unwrap();
        assert!(memory.connection().get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expiration_applies_ttl() {
        let (memory, cache) = cache(None);
        cache.set("timed", "1", Expiration::Seconds(60)).await.unwrap();
        cache.set("never", "1", Expiration::Never).await.unwrap();

        // EXPIRE NX only succeeds on keys without an expiry
        let conn = memory.connection();
        assert!(!conn.expire_nx("timed", 60).await.unwrap());
        assert!(conn.expire_nx("never", 60).await.unwrap());
    }

    #[test]
    fn test_default_expiration() {
        assert_eq!(Expiration::default(), Expiration::Seconds(10_800));
        assert_eq!(Expiration::Never.as_ttl(), None);
        assert_eq!(Expiration::Seconds(0).as_ttl(), None);
    }
}

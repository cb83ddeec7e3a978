//! Lazy invalidation cache over a write/replica connection pair.
//!
//! Reads go to the read-only path, writes to the read-write path. Values
//! written with tags are wrapped into a [`TaggedValue`] and validated against
//! the shared [`TagRegistry`] on every tag-aware read; bumping a tag never
//! touches the values that carry it.
//!
//! # Registry race
//!
//! [`TaggedStore::bump_tags`] reads the registry, updates it in memory and
//! writes the whole map back without a transaction. Two concurrent bumps of
//! disjoint tags can lose one side's update when both read before either
//! writes. Callers needing stronger guarantees must serialize bumps (for
//! example with [`crate::mutex::LockService`]).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use tagstore_core::{ConnectionPair, ScanPage, StoreResult, now_millis};

use crate::health::{HealthCheckResult, StoreStatusResult};
use crate::metrics;
use crate::tags::{TAGS_KEY, TagRegistry, TaggedValue};

/// Options for [`TaggedStore::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiry of the written key, applied with millisecond precision.
    pub ttl: Option<Duration>,
    /// Tags to wrap the value with. `None` writes the value verbatim; an
    /// explicitly empty list wraps it with no tags, which can never be
    /// invalidated.
    pub tags: Option<Vec<String>>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// A zero ttl means "no expiry".
    fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Tag-aware cache plus plain key/hash/list passthroughs.
#[derive(Debug, Clone)]
pub struct TaggedStore {
    connections: ConnectionPair,
}

impl TaggedStore {
    pub fn new(connections: ConnectionPair) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &ConnectionPair {
        &self.connections
    }

    // ==================== Tagged cache ====================

    /// Write `value` under `key`, wrapping it when tags are given.
    pub async fn set(&self, key: &str, value: &str, options: &SetOptions) -> StoreResult<()> {
        let ttl = options.effective_ttl();

        let Some(tags) = &options.tags else {
            return self.connections.read_write.set(key, value, ttl).await;
        };

        let registry = if tags.is_empty() {
            TagRegistry::new()
        } else {
            self.read_registry().await?
        };
        let wrapped = TaggedValue::wrap(value, tags.clone(), &registry);
        debug!(key = %key, tags = ?wrapped.tags, timestamp = wrapped.timestamp, "Writing tagged value");

        self.connections
            .read_write
            .set(key, &wrapped.encode()?, ttl)
            .await
    }

    /// Read a tagged value, returning `None` when it is absent or one of its
    /// tags was bumped after it was written.
    ///
    /// Fails with `ServiceUnavailable` when the stored value is not a tagged
    /// value or the registry is malformed.
    pub async fn get_using_tags(&self, key: &str) -> StoreResult<Option<String>> {
        let keys = [key.to_string(), TAGS_KEY.to_string()];
        let mut values = self.connections.read_only.mget(&keys).await?.into_iter();
        let cached = values.next().flatten();
        let registry_raw = values.next().flatten();

        let Some(cached) = cached else {
            metrics::record_tagged_miss("absent");
            return Ok(None);
        };

        let value = TaggedValue::decode(key, &cached)?;
        let registry = TagRegistry::parse(registry_raw.as_deref())?;

        if value.is_valid(&registry) {
            metrics::record_tagged_hit();
            Ok(Some(value.data))
        } else {
            debug!(key = %key, timestamp = value.timestamp, "Tagged value invalidated");
            metrics::record_tagged_miss("invalidated");
            Ok(None)
        }
    }

    /// Mark every tag in `tags` as invalidated now.
    pub async fn bump_tags<S: AsRef<str>>(&self, tags: &[S]) -> StoreResult<()> {
        let mut registry = self.read_registry().await?;
        let now = now_millis();
        registry.bump(tags, now);

        self.connections
            .read_write
            .set(TAGS_KEY, &registry.to_json()?, None)
            .await?;

        metrics::record_tag_bump(tags.len());
        info!(
            tags = ?tags.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
            timestamp = now,
            "Tags bumped"
        );
        Ok(())
    }

    /// Read-through helper over the plain (untagged) read.
    ///
    /// When nothing is cached, `producer` runs and its result is written back
    /// with `options`. A producer yielding nothing is cached as an empty
    /// string; that sentinel reads back as `None` without running the
    /// producer again.
    pub async fn remember<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: &SetOptions,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
        E: From<tagstore_core::StoreError>,
    {
        if let Some(cached) = self.get(key).await? {
            return Ok(non_empty(cached));
        }
        self.produce_and_store(key, producer, options).await
    }

    /// Like [`TaggedStore::remember`], but the cached read is tag-aware, so a
    /// bump of any of the value's tags makes `producer` run again.
    pub async fn remember_using_tags<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: &SetOptions,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
        E: From<tagstore_core::StoreError>,
    {
        if let Some(cached) = self.get_using_tags(key).await? {
            return Ok(non_empty(cached));
        }
        self.produce_and_store(key, producer, options).await
    }

    async fn produce_and_store<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: &SetOptions,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
        E: From<tagstore_core::StoreError>,
    {
        let produced = producer().await?;
        self.set(key, produced.as_deref().unwrap_or(""), options)
            .await?;
        Ok(produced)
    }

    async fn read_registry(&self) -> StoreResult<TagRegistry> {
        let raw = self.connections.read_only.get(TAGS_KEY).await?;
        TagRegistry::parse(raw.as_deref())
    }

    // ==================== Read-only passthroughs ====================

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.connections.read_only.get(key).await
    }

    pub async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.connections.read_only.mget(keys).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.connections.read_only.hget(key, field).await
    }

    pub async fn hlen(&self, key: &str) -> StoreResult<u64> {
        self.connections.read_only.hlen(key).await
    }

    pub async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.connections.read_only.hgetall(key).await
    }

    pub async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        self.connections.read_only.hvals(key).await
    }

    pub async fn hscan(&self, key: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.connections.read_only.hscan(key, cursor, count).await
    }

    pub async fn scan(&self, pattern: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.connections.read_only.scan(pattern, cursor, count).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.connections.read_only.lrange(key, start, stop).await
    }

    // ==================== Read-write passthroughs ====================

    pub async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<u64> {
        self.connections.read_write.hset(key, fields).await
    }

    pub async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64> {
        self.connections.read_write.lpush(key, values).await
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.connections.read_write.incr_by(key, delta).await
    }

    pub async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.connections.read_write.keys(pattern).await
    }

    pub async fn remove(&self, keys: &[String]) -> StoreResult<u64> {
        self.connections.read_write.del(keys).await
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
        self.connections.read_write.hdel(key, fields).await
    }

    /// Set an expiry only when the key has none (`EXPIRE ... NX`).
    pub async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        self.connections.read_write.expire_nx(key, seconds).await
    }

    pub async fn flush_db(&self) -> StoreResult<()> {
        self.connections.read_write.flush_db().await
    }

    // ==================== Lifecycle ====================

    pub fn health(&self) -> HealthCheckResult<StoreStatusResult> {
        let store = self.connections.status();
        HealthCheckResult::new(store.is_ready(), StoreStatusResult { store })
    }

    pub async fn shutdown(&self) -> StoreResult<()> {
        self.connections.quit().await
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

//! # tagstore
//!
//! Coordination services on top of a key-value store reached through a
//! write path and a (possibly lagging) read-only path.
//!
//! ## Overview
//!
//! - [`TaggedStore`]: cache with group invalidation. Values are written with
//!   tags; bumping a tag invalidates every value carrying it without touching
//!   any of them.
//! - [`PubSubDispatcher`]: routes messages to at most one handler per channel,
//!   either one-shot or persistent.
//! - [`CacheService`]: prefixed key/value cache with a default expiration.
//! - [`LockService`]: token-based distributed mutex.
//!
//! Backends live in `tagstore-redis` (production) and `tagstore-memory`
//! (single process and tests).
//!
//! ## Example
//!
//! ```ignore
//! use tagstore::{SetOptions, TaggedStore};
//!
//! let store = TaggedStore::new(tagstore_memory::MemoryStore::new().pair());
//! store.set("faq:list", &json, &SetOptions::new().with_tags(["faq"])).await?;
//!
//! // Later, after the FAQ changed:
//! store.bump_tags(&["faq"]).await?;
//! assert_eq!(store.get_using_tags("faq:list").await?, None);
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod health;
pub mod metrics;
pub mod mutex;
pub mod observability;
pub mod pubsub;
pub mod store;
pub mod tags;

pub use bootstrap::{BootstrapError, Services, ServicesHealth};
pub use cache::{CacheService, CacheSettings, Expiration};
pub use config::{AppConfig, ConfigError, LoggingConfig, RedisConfig};
pub use health::{HealthCheckResult, HealthStatus};
pub use mutex::{LockError, LockGuard, LockService, MutexSettings};
pub use pubsub::{
    HandlerError, HandlerKind, MessageHandler, PubSubDispatcher, PubSubError, PubSubSettings,
    Registration,
};
pub use store::{SetOptions, TaggedStore};
pub use tags::{TAGS_KEY, TagRegistry, TaggedValue};

pub use tagstore_core::{ConnectionPair, ConnectionState, StoreError, StoreResult};

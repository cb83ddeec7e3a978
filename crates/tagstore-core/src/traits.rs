use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;
use crate::status::{ConnectionState, PairStatus};

/// One page of a cursor-based scan.
///
/// A returned `cursor` of `"0"` means the iteration is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: String,
    pub elements: Vec<String>,
}

impl ScanPage {
    pub fn is_last(&self) -> bool {
        self.cursor == "0"
    }
}

/// A single logical path to the key-value store.
///
/// Implementations wrap one client connection. They never interpret stored
/// values; the services above decide what a value means.
#[async_trait]
pub trait KeyValueConnection: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Fetch many keys in one round-trip. The result has the same length and
    /// order as `keys`.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Write a string value, optionally with a millisecond-precision expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write only if the key does not exist. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` only while it still holds `value`.
    async fn pexpire_if_equals(&self, key: &str, value: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Set an expiry only if the key currently has none.
    async fn expire_nx(&self, key: &str, seconds: u64) -> StoreResult<bool>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn scan(&self, pattern: &str, cursor: &str, count: usize) -> StoreResult<ScanPage>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Set hash fields, returning the number of fields that were added.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<u64>;

    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<u64>;

    /// Scan a hash. Elements alternate field name and value.
    async fn hscan(&self, key: &str, cursor: &str, count: usize) -> StoreResult<ScanPage>;

    /// Prepend values, returning the new list length.
    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64>;

    /// Inclusive range; negative indices count from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn flush_db(&self) -> StoreResult<()>;

    /// Current state of the underlying connection.
    fn status(&self) -> ConnectionState;

    /// Close the connection. Further commands fail.
    async fn quit(&self) -> StoreResult<()>;
}

/// Type alias for a shareable connection.
pub type DynConnection = Arc<dyn KeyValueConnection>;

/// The write-capable path and the read-only (possibly lagging) path to the
/// same logical store.
#[derive(Clone)]
pub struct ConnectionPair {
    pub read_write: DynConnection,
    pub read_only: DynConnection,
}

impl ConnectionPair {
    pub fn new(read_write: DynConnection, read_only: DynConnection) -> Self {
        Self {
            read_write,
            read_only,
        }
    }

    pub fn status(&self) -> PairStatus {
        PairStatus {
            read_write: self.read_write.status(),
            read_only: self.read_only.status(),
        }
    }

    /// Quit both connections, reporting the first failure.
    pub async fn quit(&self) -> StoreResult<()> {
        let (rw, ro) =
            futures_util::future::join(self.read_write.quit(), self.read_only.quit()).await;
        rw.and(ro)
    }
}

impl std::fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("status", &self.status())
            .finish()
    }
}

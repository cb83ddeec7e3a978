//! In-memory key-value store.
//!
//! Keys hold strings, hashes or lists, each with an optional expiry. Expired
//! entries are purged lazily when they are touched.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tagstore_core::{
    ConnectionPair, ConnectionState, KeyValueConnection, ScanPage, StateCell, StoreError,
    StoreResult,
};

use crate::glob;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Expiry instant `ttl` from now. A ttl too large to represent never expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn with_ttl(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(deadline),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory keyspace.
///
/// Cloning is cheap and yields another handle onto the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection handle onto this keyspace.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }

    /// Build a write/replica pair over this keyspace. Both paths see the
    /// same data, so the replica never lags.
    pub fn pair(&self) -> ConnectionPair {
        ConnectionPair::new(Arc::new(self.connection()), Arc::new(self.connection()))
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }

    fn matching_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let re = glob::compile(pattern)?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired() && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn read_hash<R>(
        &self,
        key: &str,
        f: impl FnOnce(&HashMap<String, String>) -> R,
    ) -> StoreResult<Option<R>> {
        self.purge(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(Some(f(map))),
                _ => Err(StoreError::wrong_type(key)),
            },
        }
    }
}

/// Slice one page out of an ordered element list using a numeric cursor.
fn paginate(items: Vec<String>, cursor: &str, count: usize) -> StoreResult<ScanPage> {
    let offset: usize = cursor
        .parse()
        .map_err(|_| StoreError::backend(format!("invalid cursor '{cursor}'")))?;
    let count = count.max(1);
    let end = offset.saturating_add(count).min(items.len());
    let elements = items.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();
    let cursor = if end >= items.len() {
        "0".to_string()
    } else {
        end.to_string()
    };
    Ok(ScanPage { cursor, elements })
}

/// Connection handle onto a [`MemoryStore`].
///
/// The reported state starts as `ready` and can be forced with
/// [`MemoryConnection::set_state`] to simulate outages.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    store: MemoryStore,
    state: StateCell,
}

impl MemoryConnection {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            state: StateCell::new(ConnectionState::Ready),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn ensure_open(&self) -> StoreResult<()> {
        match self.state.get() {
            ConnectionState::Close | ConnectionState::End => Err(StoreError::NotConnected),
            _ => Ok(()),
        }
    }

    fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        self.store.purge(key);
        match self.store.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(StoreError::wrong_type(key)),
            },
        }
    }
}

#[async_trait]
impl KeyValueConnection for MemoryConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_open()?;
        self.get_string(key)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.ensure_open()?;
        // Non-string keys read as nil, like MGET.
        Ok(keys
            .iter()
            .map(|key| self.get_string(key).ok().flatten())
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.entries.insert(
            key.to_string(),
            Entry::with_ttl(Value::Str(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.purge(key);
        match self.store.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry::with_ttl(Value::Str(value.to_string()), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        self.ensure_open()?;
        let mut removed = 0;
        for key in keys {
            self.store.purge(key);
            if self.store.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.purge(key);
        Ok(self
            .store
            .entries
            .remove_if(key, |_, entry| matches!(&entry.value, Value::Str(s) if s == value))
            .is_some())
    }

    async fn pexpire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.purge(key);
        match self.store.entries.get_mut(key) {
            Some(mut entry) if matches!(&entry.value, Value::Str(s) if s == value) => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_nx(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.purge(key);
        match self.store.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at.is_none() => {
                entry.expires_at = deadline(Duration::from_secs(seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        self.store.matching_keys(pattern)
    }

    async fn scan(&self, pattern: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.ensure_open()?;
        paginate(self.store.matching_keys(pattern)?, cursor, count)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .store
            .read_hash(key, |map| map.get(field).cloned())?
            .flatten())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<u64> {
        self.ensure_open()?;
        self.store.purge(key);
        let mut entry = self
            .store
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                let mut added = 0;
                for (field, value) in fields {
                    if map.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(StoreError::wrong_type(key)),
        }
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        Ok(self
            .store
            .read_hash(key, |map| map.len() as u64)?
            .unwrap_or(0))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.ensure_open()?;
        Ok(self.store.read_hash(key, Clone::clone)?.unwrap_or_default())
    }

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .store
            .read_hash(key, |map| map.values().cloned().collect())?
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
        self.ensure_open()?;
        self.store.purge(key);
        let removed = match self.store.entries.get_mut(key) {
            None => return Ok(0),
            Some(mut entry) => match &mut entry.value {
                Value::Hash(map) => fields.iter().filter(|f| map.remove(*f).is_some()).count(),
                _ => return Err(StoreError::wrong_type(key)),
            },
        };
        // Emptied hashes disappear.
        self.store
            .entries
            .remove_if(key, |_, entry| matches!(&entry.value, Value::Hash(m) if m.is_empty()));
        Ok(removed as u64)
    }

    async fn hscan(&self, key: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.ensure_open()?;
        let mut fields: Vec<(String, String)> = self
            .store
            .read_hash(key, |map| {
                map.iter().map(|(f, v)| (f.clone(), v.clone())).collect()
            })?
            .unwrap_or_default();
        fields.sort();

        let names: Vec<String> = fields.iter().map(|(f, _)| f.clone()).collect();
        let page = paginate(names, cursor, count)?;
        let lookup: HashMap<String, String> = fields.into_iter().collect();
        let elements = page
            .elements
            .into_iter()
            .flat_map(|field| {
                let value = lookup.get(&field).cloned().unwrap_or_default();
                [field, value]
            })
            .collect();
        Ok(ScanPage {
            cursor: page.cursor,
            elements,
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64> {
        self.ensure_open()?;
        self.store.purge(key);
        let mut entry = self
            .store
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                for value in values {
                    list.push_front(value.clone());
                }
                Ok(list.len() as u64)
            }
            _ => Err(StoreError::wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        self.store.purge(key);
        let Some(entry) = self.store.entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &entry.value else {
            return Err(StoreError::wrong_type(key));
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.ensure_open()?;
        self.store.purge(key);
        let mut entry = self
            .store
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Str("0".to_string())));
        match &mut entry.value {
            Value::Str(current) => {
                let value: i64 = current.parse().map_err(|_| {
                    StoreError::backend("value is not an integer or out of range")
                })?;
                let next = value
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::backend("increment or decrement would overflow"))?;
                *current = next.to_string();
                Ok(next)
            }
            _ => Err(StoreError::wrong_type(key)),
        }
    }

    async fn flush_db(&self) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.entries.clear();
        Ok(())
    }

    fn status(&self) -> ConnectionState {
        self.state.get()
    }

    async fn quit(&self) -> StoreResult<()> {
        self.state.set(ConnectionState::End);
        Ok(())
    }
}

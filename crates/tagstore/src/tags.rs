//! Tag registry and tagged value codec.
//!
//! A tag is invalidated by recording the time of its last bump in the shared
//! registry stored under [`TAGS_KEY`]. A tagged value remembers the newest
//! bump time of its tags at write time; it stays valid while none of its tags
//! has been bumped since.
//!
//! ```text
//! _tags = {"faq": 1700000000000, "user:7": 1700000005000}
//! key   = {"data": "...", "tags": ["faq"], "timestamp": 1700000000000}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

use tagstore_core::{StoreError, StoreResult};

/// Reserved key holding the tag registry.
pub const TAGS_KEY: &str = "_tags";

/// Mapping from tag name to the epoch millis of its most recent bump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagRegistry {
    bumps: HashMap<String, i64>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the raw registry value. An absent key is an empty registry.
    pub fn parse(raw: Option<&str>) -> StoreResult<Self> {
        let Some(raw) = raw else {
            return Ok(Self::default());
        };
        serde_json::from_str(raw).map_err(|e| {
            error!(key = TAGS_KEY, error = %e, "Malformed tag registry");
            StoreError::service_unavailable(format!("malformed tag registry: {e}"))
        })
    }

    /// Last bump of `tag`, or 0 if it was never bumped.
    pub fn timestamp_of(&self, tag: &str) -> i64 {
        self.bumps.get(tag).copied().unwrap_or(0)
    }

    /// Record `now` as the last bump of every tag in `tags`.
    ///
    /// A tag's stamp always moves forward, even when bumped twice within the
    /// same millisecond, so a value written between two bumps is never valid
    /// after the second one.
    pub fn bump<S: AsRef<str>>(&mut self, tags: &[S], now: i64) {
        for tag in tags {
            let tag = tag.as_ref();
            let stamp = now.max(self.timestamp_of(tag).saturating_add(1));
            self.bumps.insert(tag.to_string(), stamp);
        }
    }

    pub fn len(&self) -> usize {
        self.bumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bumps.is_empty()
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A payload wrapped with its tags and freshness mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub data: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl TaggedValue {
    /// Wrap `data`, stamping it with the newest bump among `tags`.
    pub fn wrap(data: impl Into<String>, tags: Vec<String>, registry: &TagRegistry) -> Self {
        let timestamp = tags
            .iter()
            .map(|tag| registry.timestamp_of(tag))
            .max()
            .unwrap_or(0);
        Self {
            data: data.into(),
            tags,
            timestamp,
        }
    }

    /// A value is valid while none of its tags was bumped after its stamp.
    /// A value with no tags is always valid.
    pub fn is_valid(&self, registry: &TagRegistry) -> bool {
        self.tags
            .iter()
            .all(|tag| registry.timestamp_of(tag) <= self.timestamp)
    }

    /// Decode a stored value that must have been written with tag wrapping.
    pub fn decode(key: &str, raw: &str) -> StoreResult<Self> {
        serde_json::from_str(raw).map_err(|e| {
            error!(key = %key, error = %e, "Value under key is not a tagged value");
            StoreError::service_unavailable(format!("value under '{key}' is not tagged: {e}"))
        })
    }

    pub fn encode(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

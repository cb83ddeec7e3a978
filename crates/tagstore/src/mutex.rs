//! Distributed mutex on the read-write connection.
//!
//! A lock is a key (`mutex:<resource>`) holding a random token, written with
//! `SET NX PX`. Extending and releasing compare the token first, so a holder
//! whose lock expired can never touch a lock taken over by someone else.
//!
//! ```ignore
//! let guard = locks.lock("invoice:42", Duration::from_secs(10)).await?;
//! // ... critical section ...
//! guard.release().await?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tagstore_core::{DynConnection, StoreError};

use crate::health::{HealthCheckResult, MutexStatusResult};
use crate::metrics;

const KEY_PREFIX: &str = "mutex:";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock could not be acquired within the acquire timeout.
    #[error("Timed out acquiring lock on '{resource}' after {waited_ms} ms")]
    AcquireTimeout { resource: String, waited_ms: u64 },

    /// The lock expired or was taken over before it could be extended.
    #[error("Lock on '{resource}' is no longer held")]
    Lost { resource: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutex settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexSettings {
    /// Lock ttl used by [`LockService::lock_default`], in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Pause between acquisition attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_retry_interval_ms() -> u64 {
    50
}

impl Default for MutexSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

#[derive(Clone)]
pub struct LockService {
    connection: DynConnection,
    settings: MutexSettings,
}

impl LockService {
    pub fn new(connection: DynConnection, settings: MutexSettings) -> Self {
        Self {
            connection,
            settings,
        }
    }

    /// Acquire `resource` for `ttl`, retrying for up to twice the ttl.
    pub async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        info!(resource = %resource, ttl_ms = ttl.as_millis() as u64, "Start LOCK resource");

        let key = format!("{KEY_PREFIX}{resource}");
        let token = Uuid::new_v4().to_string();
        let acquire_timeout = ttl.saturating_mul(2);
        let retry_interval = Duration::from_millis(self.settings.retry_interval_ms.max(1));
        let started = Instant::now();

        loop {
            if self.connection.set_if_absent(&key, &token, ttl).await? {
                metrics::record_lock_acquired();
                debug!(resource = %resource, "Lock acquired");
                return Ok(LockGuard {
                    connection: self.connection.clone(),
                    resource: resource.to_string(),
                    key,
                    token,
                });
            }

            let waited = started.elapsed();
            if waited >= acquire_timeout {
                metrics::record_lock_timeout();
                warn!(resource = %resource, waited_ms = waited.as_millis() as u64, "Lock acquire timed out");
                return Err(LockError::AcquireTimeout {
                    resource: resource.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            tokio::time::sleep(retry_interval.min(acquire_timeout - waited)).await;
        }
    }

    /// Acquire `resource` with the configured default ttl.
    pub async fn lock_default(&self, resource: &str) -> Result<LockGuard, LockError> {
        self.lock(resource, Duration::from_millis(self.settings.default_ttl_ms))
            .await
    }

    pub fn health(&self) -> HealthCheckResult<MutexStatusResult> {
        let mutex = self.connection.status();
        HealthCheckResult::new(mutex.is_ready(), MutexStatusResult { mutex })
    }

    pub async fn shutdown(&self) -> Result<(), LockError> {
        self.connection.quit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A held lock. Dropping the guard without releasing leaves the lock to expire.
pub struct LockGuard {
    connection: DynConnection,
    resource: String,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Reset the lock's ttl, failing with [`LockError::Lost`] if it is no
    /// longer ours.
    pub async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        if self
            .connection
            .pexpire_if_equals(&self.key, &self.token, ttl)
            .await?
        {
            Ok(())
        } else {
            Err(LockError::Lost {
                resource: self.resource.clone(),
            })
        }
    }

    /// Release the lock. Releasing a lock that already expired is not an error.
    pub async fn release(self) -> Result<(), LockError> {
        let removed = self
            .connection
            .delete_if_equals(&self.key, &self.token)
            .await?;
        if !removed {
            debug!(resource = %self.resource, "Lock already expired before release");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

//! Health check results.
//!
//! Every service reports the state of the connections it depends on. A
//! service is healthy only when every reported connection is `ready`.

use serde::Serialize;

use tagstore_core::{ConnectionState, PairStatus, PubSubStatus};

/// Overall verdict, serialized with its HTTP-style code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    ServiceUnavailable,
}

impl HealthStatus {
    pub fn from_ready(ready: bool) -> Self {
        if ready {
            HealthStatus::Ok
        } else {
            HealthStatus::ServiceUnavailable
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            HealthStatus::Ok => 200,
            HealthStatus::ServiceUnavailable => 503,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult<T> {
    pub status: HealthStatus,
    pub details: T,
}

impl<T> HealthCheckResult<T> {
    pub fn new(ready: bool, details: T) -> Self {
        Self {
            status: HealthStatus::from_ready(ready),
            details,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// `{ store: { readWrite, readOnly } }`
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatusResult {
    pub store: PairStatus,
}

/// `{ pubsub: { pub, sub } }`
#[derive(Debug, Clone, Serialize)]
pub struct PubSubStatusResult {
    pub pubsub: PubSubStatus,
}

/// `{ cache: { readWrite, readOnly } }`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatusResult {
    pub cache: PairStatus,
}

/// `{ mutex: state }`
#[derive(Debug, Clone, Serialize)]
pub struct MutexStatusResult {
    pub mutex: ConnectionState,
}

//! Wiring of every service from an [`AppConfig`].

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use tagstore_core::{ConnectionPair, StoreError};
use tagstore_memory::{MemoryBroker, MemoryStore};
use tagstore_redis::{RedisPubSub, connect_pair};

use crate::cache::CacheService;
use crate::config::{AppConfig, ConfigError, loader};
use crate::health::{
    CacheStatusResult, HealthCheckResult, HealthStatus, MutexStatusResult, PubSubStatusResult,
    StoreStatusResult,
};
use crate::mutex::LockService;
use crate::observability;
use crate::pubsub::{PubSubDispatcher, PubSubError};
use crate::store::TaggedStore;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

/// All services sharing one connection pair.
#[derive(Debug)]
pub struct Services {
    pub store: TaggedStore,
    pub cache: CacheService,
    pub locks: LockService,
    pub pubsub: Option<PubSubDispatcher>,
    connections: ConnectionPair,
}

/// Aggregated health of every enabled service.
#[derive(Debug, Clone, Serialize)]
pub struct ServicesHealth {
    pub status: HealthStatus,
    pub store: HealthCheckResult<StoreStatusResult>,
    pub cache: HealthCheckResult<CacheStatusResult>,
    pub mutex: HealthCheckResult<MutexStatusResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubsub: Option<HealthCheckResult<PubSubStatusResult>>,
}

impl Services {
    /// Load `.env`, the config file and environment overrides, initialize
    /// tracing and connect to Redis.
    pub async fn init(config_path: Option<&str>) -> Result<Self, BootstrapError> {
        let _ = dotenvy::dotenv();
        let config = loader::load_config(config_path)?;
        if !observability::init(&config.logging)? {
            warn!("A tracing subscriber is already installed; logging.level is ignored");
        }
        Self::connect(&config).await
    }

    /// Connect every service to the Redis endpoints in `config`.
    pub async fn connect(config: &AppConfig) -> Result<Self, BootstrapError> {
        let redis = &config.redis;
        let connections = connect_pair(&redis.read_write, &redis.read_only).await?;

        let pubsub = if redis.enable_pubsub {
            let transport = RedisPubSub::connect(&redis.read_write, &redis.read_only).await?;
            Some(PubSubDispatcher::start(Arc::new(transport), &config.pubsub)?)
        } else {
            None
        };

        info!(pubsub = redis.enable_pubsub, "Services connected");
        Ok(Self::assemble(connections, pubsub, config))
    }

    /// Build every service over an in-process store and broker.
    pub fn from_memory(config: &AppConfig) -> Result<Self, BootstrapError> {
        let connections = MemoryStore::new().pair();
        let pubsub = if config.redis.enable_pubsub {
            let broker = MemoryBroker::new();
            Some(PubSubDispatcher::start(
                Arc::new(broker.endpoint()),
                &config.pubsub,
            )?)
        } else {
            None
        };
        Ok(Self::assemble(connections, pubsub, config))
    }

    fn assemble(
        connections: ConnectionPair,
        pubsub: Option<PubSubDispatcher>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store: TaggedStore::new(connections.clone()),
            cache: CacheService::new(connections.clone(), &config.cache),
            locks: LockService::new(connections.read_write.clone(), config.mutex.clone()),
            pubsub,
            connections,
        }
    }

    pub fn health(&self) -> ServicesHealth {
        let store = self.store.health();
        let cache = self.cache.health();
        let mutex = self.locks.health();
        let pubsub = self.pubsub.as_ref().map(PubSubDispatcher::health);

        let ready = store.is_ok()
            && cache.is_ok()
            && mutex.is_ok()
            && pubsub.as_ref().is_none_or(HealthCheckResult::is_ok);

        ServicesHealth {
            status: HealthStatus::from_ready(ready),
            store,
            cache,
            mutex,
            pubsub,
        }
    }

    /// Close the dispatcher and both store connections.
    pub async fn shutdown(&self) -> Result<(), BootstrapError> {
        if let Some(pubsub) = &self.pubsub {
            if let Err(e) = pubsub.shutdown().await {
                warn!(error = %e, "Pub/sub shutdown failed");
            }
        }
        self.connections.quit().await?;
        info!("Services stopped");
        Ok(())
    }
}

//! Redis key-value connection for one store path.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script, cmd};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, error, info};

use tagstore_core::{
    ConnectionPair, ConnectionRole, ConnectionState, KeyValueConnection, ScanPage, StateCell,
    StoreError, StoreResult,
};

use crate::settings::ConnectionSettings;

static DELETE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end"#,
    )
});

static PEXPIRE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end"#,
    )
});

/// Errors that mean the socket is gone rather than the command being wrong.
pub(crate) fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

pub(crate) fn map_redis_error(err: RedisError) -> StoreError {
    if is_connection_error(&err) {
        StoreError::connection(err.to_string())
    } else {
        StoreError::backend(err.to_string())
    }
}

/// Open a `ConnectionManager`, bounded by the configured connect timeout.
pub(crate) async fn open_manager(
    settings: &ConnectionSettings,
    label: &str,
) -> StoreResult<ConnectionManager> {
    let client = Client::open(settings.url.as_str())
        .map_err(|e| StoreError::connection(format!("invalid Redis url: {e}")))?;

    match tokio::time::timeout(settings.connect_timeout(), ConnectionManager::new(client)).await {
        Ok(Ok(manager)) => Ok(manager),
        Ok(Err(e)) => {
            error!(
                connection = %label,
                url = %settings.redacted_url(),
                error = %e,
                "Redis connection error"
            );
            Err(map_redis_error(e))
        }
        Err(_) => {
            error!(
                connection = %label,
                url = %settings.redacted_url(),
                timeout_ms = settings.connect_timeout_ms,
                "Redis connection timed out"
            );
            Err(StoreError::connection(format!(
                "{label} connection to {} timed out",
                settings.redacted_url()
            )))
        }
    }
}

/// One path (read-write or read-only) to a Redis server.
///
/// Cloning shares the underlying multiplexed connection and state.
#[derive(Clone)]
pub struct RedisConnection {
    connection: ConnectionManager,
    role: ConnectionRole,
    state: StateCell,
}

impl RedisConnection {
    /// Connect to the endpoint described by `settings`.
    pub async fn connect(settings: &ConnectionSettings, role: ConnectionRole) -> StoreResult<Self> {
        let state = StateCell::new(ConnectionState::Connecting);
        let connection = open_manager(settings, role.label()).await?;
        state.set(ConnectionState::Ready);

        info!(
            url = %settings.redacted_url(),
            "Store {} connection open",
            role.label()
        );

        Ok(Self {
            connection,
            role,
            state,
        })
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Run one command against a fresh handle of the shared connection and
    /// fold the outcome into the tracked state.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if self.state.get() == ConnectionState::End {
            return Err(StoreError::NotConnected);
        }

        let result = f(self.connection.clone()).await;
        match &result {
            Ok(_) => {
                if self.state.set(ConnectionState::Ready) == ConnectionState::Reconnecting {
                    info!(connection = %self.role, "Store connection restored");
                }
            }
            Err(e) if is_connection_error(e) => {
                self.state.set(ConnectionState::Reconnecting);
                error!(connection = %self.role, op, error = %e, "Store connection error");
            }
            Err(e) => {
                debug!(connection = %self.role, op, error = %e, "Store command failed");
            }
        }
        result.map_err(map_redis_error)
    }
}

/// Connect both paths of a store.
pub async fn connect_pair(
    read_write: &ConnectionSettings,
    read_only: &ConnectionSettings,
) -> StoreResult<ConnectionPair> {
    let (rw, ro) = futures_util::future::try_join(
        RedisConnection::connect(read_write, ConnectionRole::ReadWrite),
        RedisConnection::connect(read_only, ConnectionRole::ReadOnly),
    )
    .await?;
    Ok(ConnectionPair::new(Arc::new(rw), Arc::new(ro)))
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueConnection for RedisConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run("get", |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("mget", |mut conn| async move {
            cmd("MGET").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run("set", |mut conn| async move {
            let mut command = cmd("SET");
            command.arg(key).arg(value);
            if let Some(ttl) = ttl {
                command.arg("PX").arg(millis(ttl));
            }
            command.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.run("set_nx", |mut conn| async move {
            let reply: Option<String> = cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run("del", |mut conn| async move { conn.del(keys).await })
            .await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.run("delete_if_equals", |mut conn| async move {
            let removed: i64 = DELETE_IF_EQUALS
                .key(key)
                .arg(value)
                .invoke_async(&mut conn)
                .await?;
            Ok(removed == 1)
        })
        .await
    }

    async fn pexpire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.run("pexpire_if_equals", |mut conn| async move {
            let updated: i64 = PEXPIRE_IF_EQUALS
                .key(key)
                .arg(value)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(updated == 1)
        })
        .await
    }

    async fn expire_nx(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        self.run("expire_nx", |mut conn| async move {
            let applied: i64 = cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .arg("NX")
                .query_async(&mut conn)
                .await?;
            Ok(applied == 1)
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.run("keys", |mut conn| async move { conn.keys(pattern).await })
            .await
    }

    async fn scan(&self, pattern: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.run("scan", |mut conn| async move {
            let (cursor, elements): (String, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(ScanPage { cursor, elements })
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.run("hget", |mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.run("hset", |mut conn| async move {
            let mut command = cmd("HSET");
            command.arg(key);
            for (field, value) in fields {
                command.arg(field).arg(value);
            }
            command.query_async(&mut conn).await
        })
        .await
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        self.run("hlen", |mut conn| async move { conn.hlen(key).await })
            .await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.run("hgetall", |mut conn| async move { conn.hgetall(key).await })
            .await
    }

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run("hvals", |mut conn| async move { conn.hvals(key).await })
            .await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.run("hdel", |mut conn| async move { conn.hdel(key, fields).await })
            .await
    }

    async fn hscan(&self, key: &str, cursor: &str, count: usize) -> StoreResult<ScanPage> {
        self.run("hscan", |mut conn| async move {
            let (cursor, elements): (String, Vec<String>) = cmd("HSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(ScanPage { cursor, elements })
        })
        .await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> StoreResult<u64> {
        if values.is_empty() {
            return self
                .run("llen", |mut conn| async move { conn.llen(key).await })
                .await;
        }
        self.run("lpush", |mut conn| async move { conn.lpush(key, values).await })
            .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.run("lrange", |mut conn| async move {
            conn.lrange(key, start as isize, stop as isize).await
        })
        .await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.run("incrby", |mut conn| async move { conn.incr(key, delta).await })
            .await
    }

    async fn flush_db(&self) -> StoreResult<()> {
        self.run("flushdb", |mut conn| async move {
            cmd("FLUSHDB").query_async::<()>(&mut conn).await
        })
        .await
    }

    fn status(&self) -> ConnectionState {
        self.state.get()
    }

    async fn quit(&self) -> StoreResult<()> {
        // The multiplexed connection closes once the last handle is dropped.
        if self.state.set(ConnectionState::End) != ConnectionState::End {
            info!(connection = %self.role, "Store connection closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("role", &self.role)
            .field("state", &self.state.get())
            .finish()
    }
}

//! Channel-correlated pub/sub dispatcher.
//!
//! Each channel holds at most one [`Registration`]: either a one-shot
//! handler, fired for the first message only, or a persistent handler, fired
//! for every message until the channel is unsubscribed. Handlers are:
//! - **Async**: each invocation runs in its own tokio task
//! - **Isolated**: errors, panics and timeouts are logged and counted, never
//!   propagated to the dispatcher
//!
//! ## Example
//!
//! ```ignore
//! use tagstore::pubsub::{HandlerError, PubSubDispatcher, PubSubSettings};
//!
//! let dispatcher = PubSubDispatcher::start(transport, &PubSubSettings::default())?;
//! dispatcher
//!     .once_channel_message("jobs:42", |message: String| async move {
//!         println!("job finished: {message}");
//!         Ok::<_, HandlerError>(())
//!     })
//!     .await?;
//! dispatcher.publish("jobs:42", &serde_json::json!({"ok": true})).await?;
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tagstore_core::{InboundMessage, PubSubTransport, StoreError};

use crate::health::{HealthCheckResult, PubSubStatusResult};
use crate::metrics;

/// Shared transport handle.
pub type DynTransport = Arc<dyn PubSubTransport>;

/// Shared handler handle.
pub type DynHandler = Arc<dyn MessageHandler>;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by a message handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handler execution failed with a message.
    #[error("Handler execution failed: {0}")]
    Execution(String),

    /// The message payload could not be decoded.
    #[error("Payload decode failed: {0}")]
    Decode(String),

    /// Generic error with source.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn execution(msg: impl Into<String>) -> Self {
        HandlerError::Execution(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

/// Errors returned to callers of the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// The channel already has a registration. State is unchanged.
    #[error("Handler already exists for channel '{channel}' ({existing})")]
    HandlerAlreadyRegistered {
        channel: String,
        existing: HandlerKind,
    },

    /// The payload could not be serialized for publishing.
    #[error("Failed to serialize payload for channel '{channel}': {message}")]
    Serialization { channel: String, message: String },

    /// The transport's inbound stream was already taken by another dispatcher.
    #[error("Inbound message stream already taken")]
    StreamTaken,

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] StoreError),
}

impl PubSubError {
    pub fn is_already_registered(&self) -> bool {
        matches!(self, PubSubError::HandlerAlreadyRegistered { .. })
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for messages received on a channel.
///
/// Any `Fn(String) -> impl Future<Output = Result<(), HandlerError>>`
/// closure implements this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: String) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: String) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    OneShot,
    Persistent,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::OneShot => "one-shot",
            HandlerKind::Persistent => "persistent",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single registration a channel may hold.
#[derive(Clone)]
pub enum Registration {
    OneShot(DynHandler),
    Persistent(DynHandler),
}

impl Registration {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Registration::OneShot(_) => HandlerKind::OneShot,
            Registration::Persistent(_) => HandlerKind::Persistent,
        }
    }

    fn handler(&self) -> &DynHandler {
        match self {
            Registration::OneShot(h) | Registration::Persistent(h) => h,
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration").field(&self.kind()).finish()
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubSettings {
    /// Upper bound for a single handler invocation, in milliseconds.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

impl PubSubSettings {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Inner {
    transport: DynTransport,
    handlers: DashMap<String, Registration>,
    handler_timeout: Duration,
}

/// Routes inbound messages to the handler registered for their channel.
pub struct PubSubDispatcher {
    inner: Arc<Inner>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubDispatcher {
    /// Take the transport's inbound stream and start the drain task.
    pub fn start(transport: DynTransport, settings: &PubSubSettings) -> Result<Self, PubSubError> {
        let messages = transport.take_messages().ok_or(PubSubError::StreamTaken)?;

        let inner = Arc::new(Inner {
            transport,
            handlers: DashMap::new(),
            handler_timeout: settings.handler_timeout(),
        });

        let drain_inner = inner.clone();
        let drain = tokio::spawn(async move {
            let mut messages = messages;
            while let Some(message) = messages.next().await {
                drain_inner.route(message).await;
            }
            debug!("Inbound message stream closed");
        });

        Ok(Self {
            inner,
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Serialize `payload` as JSON and publish it. Returns the number of
    /// subscribers that received it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<u64, PubSubError> {
        let encoded =
            serde_json::to_string(payload).map_err(|e| PubSubError::Serialization {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;
        let receivers = self.inner.transport.publish(channel, &encoded).await?;
        metrics::record_published();
        debug!(channel = %channel, receivers, "Published message");
        Ok(receivers)
    }

    /// Register `handler` for every message on `channel` until unsubscribed.
    pub async fn on_channel_message<H>(&self, channel: &str, handler: H) -> Result<(), PubSubError>
    where
        H: MessageHandler + 'static,
    {
        self.register(channel, Registration::Persistent(Arc::new(handler)))
            .await
    }

    /// Register `handler` for the next message on `channel` only.
    ///
    /// The registration is removed and the channel unsubscribed before the
    /// handler runs, so it fires at most once.
    pub async fn once_channel_message<H>(
        &self,
        channel: &str,
        handler: H,
    ) -> Result<(), PubSubError>
    where
        H: MessageHandler + 'static,
    {
        self.register(channel, Registration::OneShot(Arc::new(handler)))
            .await
    }

    async fn register(&self, channel: &str, registration: Registration) -> Result<(), PubSubError> {
        let kind = registration.kind();
        let inserted = registration.handler().clone();
        match self.inner.handlers.entry(channel.to_string()) {
            Entry::Occupied(existing) => {
                return Err(PubSubError::HandlerAlreadyRegistered {
                    channel: channel.to_string(),
                    existing: existing.get().kind(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(registration);
            }
        }

        if let Err(e) = self.inner.transport.subscribe(channel).await {
            // Only roll back our own entry; the channel may have been
            // unsubscribed and registered again meanwhile.
            self.inner
                .handlers
                .remove_if(channel, |_, r| Arc::ptr_eq(r.handler(), &inserted));
            error!(channel = %channel, error = %e, "Failed to subscribe");
            return Err(e.into());
        }

        debug!(channel = %channel, kind = %kind, "Handler registered");
        Ok(())
    }

    /// Drop any registration for `channel` and unsubscribe. Idempotent.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        if let Some((_, registration)) = self.inner.handlers.remove(channel) {
            debug!(channel = %channel, kind = %registration.kind(), "Handler removed");
        }
        self.inner.transport.unsubscribe(channel).await?;
        Ok(())
    }

    /// Kind of the registration currently held by `channel`, if any.
    pub fn registration(&self, channel: &str) -> Option<HandlerKind> {
        self.inner.handlers.get(channel).map(|r| r.kind())
    }

    pub fn health(&self) -> HealthCheckResult<PubSubStatusResult> {
        let pubsub = self.inner.transport.status();
        HealthCheckResult::new(pubsub.is_ready(), PubSubStatusResult { pubsub })
    }

    /// Stop routing messages and close the transport.
    pub async fn shutdown(&self) -> Result<(), PubSubError> {
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            drain.abort();
        }
        self.inner.handlers.clear();
        self.inner.transport.quit().await?;
        info!("Pub/sub dispatcher stopped");
        Ok(())
    }
}

impl Drop for PubSubDispatcher {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.get_mut().take() {
            drain.abort();
        }
    }
}

impl fmt::Debug for PubSubDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubDispatcher")
            .field("channels", &self.inner.handlers.len())
            .field("handler_timeout", &self.inner.handler_timeout)
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn route(&self, message: InboundMessage) {
        let InboundMessage { channel, payload } = message;

        let (kind, handler) = match self.resolve(&channel) {
            Some(resolved) => resolved,
            None => {
                metrics::record_unroutable();
                error!(channel = %channel, "Could not find a message handler for the channel");
                return;
            }
        };

        if kind == HandlerKind::OneShot {
            self.release_one_shot(&channel).await;
        }

        metrics::record_routed(kind.as_str());
        self.spawn_handler(channel, kind, handler, payload);
    }

    /// Drop the subscription of a fired one-shot channel.
    ///
    /// The registration slot is free as soon as the one-shot entry is
    /// removed, so a new handler may have subscribed while the unsubscribe was
    /// in flight. Its subscription is restored here.
    async fn release_one_shot(&self, channel: &str) {
        if let Err(e) = self.transport.unsubscribe(channel).await {
            warn!(channel = %channel, error = %e, "Failed to unsubscribe one-shot channel");
            return;
        }
        if self.handlers.contains_key(channel) {
            debug!(channel = %channel, "Channel registered again during one-shot teardown");
            if let Err(e) = self.transport.subscribe(channel).await {
                error!(channel = %channel, error = %e, "Failed to resubscribe channel");
            }
        }
    }

    /// One-shot registrations are removed atomically; persistent ones stay.
    fn resolve(&self, channel: &str) -> Option<(HandlerKind, DynHandler)> {
        if let Some((_, registration)) = self
            .handlers
            .remove_if(channel, |_, r| r.kind() == HandlerKind::OneShot)
        {
            return Some((HandlerKind::OneShot, registration.handler().clone()));
        }
        self.handlers
            .get(channel)
            .map(|r| (r.kind(), r.handler().clone()))
    }

    fn spawn_handler(&self, channel: String, kind: HandlerKind, handler: DynHandler, payload: String) {
        let timeout = self.handler_timeout;

        // Each handler runs in an isolated task
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, async {
                AssertUnwindSafe(handler.handle(payload)).catch_unwind().await
            })
            .await;

            match result {
                Ok(Ok(Ok(()))) => {
                    debug!(channel = %channel, kind = %kind, "Handler completed");
                }
                Ok(Ok(Err(e))) => {
                    metrics::record_handler_failure("error");
                    error!(
                        channel = %channel,
                        error = %e,
                        "Failed to handle message from the channel"
                    );
                }
                Ok(Err(panic)) => {
                    metrics::record_handler_failure("panic");
                    let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(channel = %channel, panic = %panic_msg, "Handler panicked");
                }
                Err(_) => {
                    metrics::record_handler_failure("timeout");
                    error!(
                        channel = %channel,
                        timeout_ms = timeout.as_millis() as u64,
                        "Handler timed out"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagstore_memory::MemoryBroker;

    #[test]
    fn test_handler_kind_display() {
        assert_eq!(HandlerKind::OneShot.to_string(), "one-shot");
        assert_eq!(HandlerKind::Persistent.to_string(), "persistent");
    }

    #[test]
    fn test_settings_default_timeout() {
        let settings: PubSubSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.handler_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_error_display() {
        let err = PubSubError::HandlerAlreadyRegistered {
            channel: "c".into(),
            existing: HandlerKind::Persistent,
        };
        assert_eq!(
            err.to_string(),
            "Handler already exists for channel 'c' (persistent)"
        );
        assert!(err.is_already_registered());
    }

    #[tokio::test]
    async fn test_start_takes_stream_once() {
        let broker = MemoryBroker::new();
        let transport: DynTransport = Arc::new(broker.endpoint());

        let _dispatcher = PubSubDispatcher::start(transport.clone(), &PubSubSettings::default())
            .unwrap();
        let second = PubSubDispatcher::start(transport, &PubSubSettings::default());
        assert!(matches!(second, Err(PubSubError::StreamTaken)));
    }

    #[tokio::test]
    async fn test_mixed_kinds_are_exclusive() {
        let broker = MemoryBroker::new();
        let dispatcher =
            PubSubDispatcher::start(Arc::new(broker.endpoint()), &PubSubSettings::default())
                .unwrap();

        dispatcher
            .on_channel_message("c", |_m: String| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap();
        let err = dispatcher
            .once_channel_message("c", |_m: String| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PubSubError::HandlerAlreadyRegistered {
                existing: HandlerKind::Persistent,
                ..
            }
        ));
        assert_eq!(dispatcher.registration("c"), Some(HandlerKind::Persistent));
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back() {
        let broker = MemoryBroker::new();
        let endpoint = Arc::new(broker.endpoint());
        let dispatcher =
            PubSubDispatcher::start(endpoint.clone(), &PubSubSettings::default()).unwrap();

        endpoint.set_state(
            tagstore_core::ConnectionState::Ready,
            tagstore_core::ConnectionState::End,
        );
        let err = dispatcher
            .once_channel_message("c", |_m: String| async { Ok::<(), HandlerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Transport(StoreError::NotConnected)));
        assert_eq!(dispatcher.registration("c"), None);
    }
}

//! Publish/subscribe transport contract.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreResult;
use crate::status::PubSubStatus;

/// A message delivered by the transport for a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of every message received on the subscribe connection.
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// Transport with one publish connection and one subscribe connection.
///
/// Subscriptions are tracked by the transport itself; the inbound stream
/// carries messages for all of them and can be taken exactly once.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish a raw payload, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64>;

    async fn subscribe(&self, channel: &str) -> StoreResult<()>;

    /// Unsubscribing from a channel that is not subscribed is a no-op.
    async fn unsubscribe(&self, channel: &str) -> StoreResult<()>;

    /// Hand over the inbound stream. Returns `None` on every call after the first.
    fn take_messages(&self) -> Option<InboundStream>;

    fn status(&self) -> PubSubStatus;

    async fn quit(&self) -> StoreResult<()>;
}

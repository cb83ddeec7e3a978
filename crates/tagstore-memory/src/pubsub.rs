//! In-process publish/subscribe broker.
//!
//! A [`MemoryBroker`] plays the role of the shared transport; every
//! [`MemoryPubSub`] endpoint created from it behaves like a client holding a
//! publish connection and a subscribe connection.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use tagstore_core::{
    ConnectionState, InboundMessage, InboundStream, PubSubStatus, PubSubTransport, StateCell,
    StoreError, StoreResult,
};

type Subscribers = HashMap<u64, mpsc::UnboundedSender<InboundMessage>>;

#[derive(Debug, Default)]
struct BrokerInner {
    channels: DashMap<String, Subscribers>,
    next_id: AtomicU64,
}

/// Shared message bus. Cloning yields another handle to the same bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new client endpoint attached to this bus.
    pub fn endpoint(&self) -> MemoryPubSub {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        MemoryPubSub {
            id,
            broker: self.clone(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            channels: Mutex::new(HashSet::new()),
            publisher: StateCell::new(ConnectionState::Ready),
            subscriber: StateCell::new(ConnectionState::Ready),
        }
    }

    /// Number of endpoints currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn deliver(&self, channel: &str, payload: &str) -> u64 {
        let Some(subscribers) = self.inner.channels.get(channel) else {
            return 0;
        };
        subscribers
            .values()
            .filter(|tx| tx.send(InboundMessage::new(channel, payload)).is_ok())
            .count() as u64
    }

    fn attach(&self, channel: &str, id: u64, sender: mpsc::UnboundedSender<InboundMessage>) {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, sender);
    }

    fn detach(&self, channel: &str, id: u64) {
        if let Some(mut subs) = self.inner.channels.get_mut(channel) {
            subs.remove(&id);
        }
        self.inner
            .channels
            .remove_if(channel, |_, subs| subs.is_empty());
    }
}

/// One client of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryPubSub {
    id: u64,
    broker: MemoryBroker,
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    channels: Mutex<HashSet<String>>,
    publisher: StateCell,
    subscriber: StateCell,
}

impl MemoryPubSub {
    /// Force the reported connection states (outage simulation).
    pub fn set_state(&self, publisher: ConnectionState, subscriber: ConnectionState) {
        self.publisher.set(publisher);
        self.subscriber.set(subscriber);
    }

    /// Channels this endpoint is currently subscribed to.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().iter().cloned().collect();
        channels.sort();
        channels
    }

    fn ensure_open(state: &StateCell) -> StoreResult<()> {
        match state.get() {
            ConnectionState::Close | ConnectionState::End => Err(StoreError::NotConnected),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        Self::ensure_open(&self.publisher)?;
        Ok(self.broker.deliver(channel, payload))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        Self::ensure_open(&self.subscriber)?;
        if self.channels.lock().insert(channel.to_string()) {
            self.broker.attach(channel, self.id, self.sender.clone());
            tracing::debug!(channel = %channel, "memory endpoint subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        Self::ensure_open(&self.subscriber)?;
        if self.channels.lock().remove(channel) {
            self.broker.detach(channel, self.id);
            tracing::debug!(channel = %channel, "memory endpoint unsubscribed");
        }
        Ok(())
    }

    fn take_messages(&self) -> Option<InboundStream> {
        self.receiver
            .lock()
            .take()
            .map(|rx| UnboundedReceiverStream::new(rx).boxed())
    }

    fn status(&self) -> PubSubStatus {
        PubSubStatus {
            publisher: self.publisher.get(),
            subscriber: self.subscriber.get(),
        }
    }

    async fn quit(&self) -> StoreResult<()> {
        let channels: Vec<String> = self.channels.lock().drain().collect();
        for channel in channels {
            self.broker.detach(&channel, self.id);
        }
        self.publisher.set(ConnectionState::End);
        self.subscriber.set(ConnectionState::End);
        Ok(())
    }
}

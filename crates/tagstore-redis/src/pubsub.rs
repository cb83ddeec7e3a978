//! Redis pub/sub transport.
//!
//! Publishing goes through a multiplexed `ConnectionManager`. Subscribing needs
//! a dedicated connection (pooled connections can't be used for SUBSCRIBE), so
//! it is owned by a [`SubscriberActor`] task that serializes SUBSCRIBE and
//! UNSUBSCRIBE commands with message delivery.
//!
//! ## Example Flow
//!
//! ```text
//! dispatcher.subscribe("jobs:42")
//!   ↓ command channel
//! SubscriberActor: SUBSCRIBE jobs:42
//!   ↓
//! Redis: PUBLISH jobs:42 "{...}"
//!   ↓
//! SubscriberActor → inbound channel → dispatcher drain task
//! ```

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use tagstore_core::{
    ConnectionState, InboundMessage, InboundStream, PubSubStatus, PubSubTransport, StateCell,
    StoreError, StoreResult,
};

use crate::connection::{is_connection_error, map_redis_error, open_manager};
use crate::settings::ConnectionSettings;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300); // 5 minutes max

type Reply = oneshot::Sender<StoreResult<()>>;

enum SubscriberCommand {
    Subscribe { channel: String, reply: Reply },
    Unsubscribe { channel: String, reply: Reply },
    Shutdown,
}

/// Redis-backed [`PubSubTransport`].
pub struct RedisPubSub {
    publisher: ConnectionManager,
    publisher_state: StateCell,
    subscriber_state: StateCell,
    commands: mpsc::UnboundedSender<SubscriberCommand>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl RedisPubSub {
    /// Open the publish connection on `publish` and the subscribe connection
    /// on `subscribe`, then start the subscriber actor.
    pub async fn connect(
        publish: &ConnectionSettings,
        subscribe: &ConnectionSettings,
    ) -> StoreResult<Self> {
        let publisher_state = StateCell::new(ConnectionState::Connecting);
        let subscriber_state = StateCell::new(ConnectionState::Connecting);

        let publisher = open_manager(publish, "READ-WRITE pub").await?;
        publisher_state.set(ConnectionState::Ready);
        info!(url = %publish.redacted_url(), "Redis READ-WRITE pub connection open");

        let pubsub = open_pubsub(subscribe).await?;
        subscriber_state.set(ConnectionState::Ready);
        info!(url = %subscribe.redacted_url(), "Redis READ-ONLY sub connection open");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let actor = SubscriberActor {
            settings: subscribe.clone(),
            channels: HashSet::new(),
            state: subscriber_state.clone(),
            commands: command_rx,
            inbound: message_tx,
        };
        let handle = tokio::spawn(actor.run(pubsub));

        Ok(Self {
            publisher,
            publisher_state,
            subscriber_state,
            commands: command_tx,
            messages: Mutex::new(Some(message_rx)),
            actor: Mutex::new(Some(handle)),
        })
    }

    async fn send_command(
        &self,
        build: impl FnOnce(Reply) -> SubscriberCommand,
    ) -> StoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| StoreError::NotConnected)?;
        reply_rx.await.map_err(|_| StoreError::NotConnected)?
    }
}

async fn open_pubsub(settings: &ConnectionSettings) -> StoreResult<PubSub> {
    let client = redis::Client::open(settings.url.as_str())
        .map_err(|e| StoreError::connection(format!("invalid Redis url: {e}")))?;

    match tokio::time::timeout(settings.connect_timeout(), client.get_async_pubsub()).await {
        Ok(Ok(pubsub)) => Ok(pubsub),
        Ok(Err(e)) => {
            error!(error = %e, "Redis READ-ONLY sub connection error");
            Err(map_redis_error(e))
        }
        Err(_) => Err(StoreError::connection(format!(
            "sub connection to {} timed out",
            settings.redacted_url()
        ))),
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        if self.publisher_state.get() == ConnectionState::End {
            return Err(StoreError::NotConnected);
        }

        let mut conn = self.publisher.clone();
        let result: redis::RedisResult<u64> = conn.publish(channel, payload).await;
        match result {
            Ok(receivers) => {
                self.publisher_state.set(ConnectionState::Ready);
                Ok(receivers)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    self.publisher_state.set(ConnectionState::Reconnecting);
                    error!(channel = %channel, error = %e, "Redis READ-WRITE pub connection error");
                }
                Err(map_redis_error(e))
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        let channel = channel.to_string();
        self.send_command(|reply| SubscriberCommand::Subscribe { channel, reply })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        let channel = channel.to_string();
        self.send_command(|reply| SubscriberCommand::Unsubscribe { channel, reply })
            .await
    }

    fn take_messages(&self) -> Option<InboundStream> {
        self.messages
            .lock()
            .take()
            .map(|rx| UnboundedReceiverStream::new(rx).boxed())
    }

    fn status(&self) -> PubSubStatus {
        PubSubStatus {
            publisher: self.publisher_state.get(),
            subscriber: self.subscriber_state.get(),
        }
    }

    async fn quit(&self) -> StoreResult<()> {
        let _ = self.commands.send(SubscriberCommand::Shutdown);
        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Subscriber task ended abnormally");
            }
        }
        self.publisher_state.set(ConnectionState::End);
        self.subscriber_state.set(ConnectionState::End);
        Ok(())
    }
}

enum Event {
    Command(Option<SubscriberCommand>),
    Message(Option<redis::Msg>),
}

enum Exit {
    Shutdown,
    StreamEnded,
}

/// Owns the subscribe connection and the set of active channels.
struct SubscriberActor {
    settings: ConnectionSettings,
    channels: HashSet<String>,
    state: StateCell,
    commands: mpsc::UnboundedReceiver<SubscriberCommand>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl SubscriberActor {
    async fn run(mut self, mut pubsub: PubSub) {
        loop {
            match self.drive(&mut pubsub).await {
                Exit::Shutdown => break,
                Exit::StreamEnded => {
                    warn!("Redis pub/sub stream ended");
                    self.state.set(ConnectionState::Reconnecting);
                    match self.reconnect().await {
                        Some(fresh) => pubsub = fresh,
                        None => break,
                    }
                }
            }
        }
        self.state.set(ConnectionState::End);
        debug!("Subscriber task stopped");
    }

    async fn drive(&mut self, pubsub: &mut PubSub) -> Exit {
        loop {
            let event = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    command = self.commands.recv() => Event::Command(command),
                    message = stream.next() => Event::Message(message),
                }
            };

            match event {
                Event::Command(None) | Event::Command(Some(SubscriberCommand::Shutdown)) => {
                    return Exit::Shutdown;
                }
                Event::Command(Some(SubscriberCommand::Subscribe { channel, reply })) => {
                    let result = pubsub.subscribe(&channel).await.map_err(map_redis_error);
                    if result.is_ok() {
                        debug!(channel = %channel, "Subscribed");
                        self.channels.insert(channel);
                    }
                    let _ = reply.send(result);
                }
                Event::Command(Some(SubscriberCommand::Unsubscribe { channel, reply })) => {
                    self.channels.remove(&channel);
                    let result = pubsub.unsubscribe(&channel).await.map_err(map_redis_error);
                    if result.is_ok() {
                        debug!(channel = %channel, "Unsubscribed");
                    }
                    let _ = reply.send(result);
                }
                Event::Message(Some(msg)) => {
                    let channel = msg.get_channel_name().to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if self.inbound.send(InboundMessage { channel, payload }).is_err() {
                                debug!("Inbound receiver dropped, discarding message");
                            }
                        }
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Failed to read pub/sub message payload");
                        }
                    }
                }
                Event::Message(None) => return Exit::StreamEnded,
            }
        }
    }

    /// Reconnect with exponential backoff, resubscribing every active channel.
    ///
    /// Commands received while disconnected update the channel set and are
    /// acknowledged; they take effect on resubscription. Returns `None` on
    /// shutdown.
    async fn reconnect(&mut self) -> Option<PubSub> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        None | Some(SubscriberCommand::Shutdown) => return None,
                        Some(SubscriberCommand::Subscribe { channel, reply }) => {
                            self.channels.insert(channel);
                            let _ = reply.send(Ok(()));
                        }
                        Some(SubscriberCommand::Unsubscribe { channel, reply }) => {
                            self.channels.remove(&channel);
                            let _ = reply.send(Ok(()));
                        }
                    },
                }
            }

            self.state.set(ConnectionState::Connecting);
            match self.resubscribe().await {
                Ok(pubsub) => {
                    self.state.set(ConnectionState::Ready);
                    info!(
                        channels = self.channels.len(),
                        "Redis READ-ONLY sub connection restored"
                    );
                    return Some(pubsub);
                }
                Err(e) => {
                    self.state.set(ConnectionState::Reconnecting);
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Redis sub reconnect failed, retrying..."
                    );
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn resubscribe(&self) -> StoreResult<PubSub> {
        let mut pubsub = open_pubsub(&self.settings).await?;
        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(map_redis_error)?;
        }
        Ok(pubsub)
    }
}

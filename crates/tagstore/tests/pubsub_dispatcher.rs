//! Integration tests for the pub/sub dispatcher over the in-process broker.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tagstore::{HandlerError, HandlerKind, PubSubDispatcher, PubSubError, PubSubSettings};
use tagstore_core::{
    ConnectionState, InboundStream, PubSubStatus, PubSubTransport, StoreError, StoreResult,
};
use tagstore_memory::{MemoryBroker, MemoryPubSub};
use tokio::sync::{Semaphore, mpsc};

struct Fixture {
    broker: MemoryBroker,
    endpoint: Arc<MemoryPubSub>,
    dispatcher: PubSubDispatcher,
}

fn setup_with(settings: PubSubSettings) -> Fixture {
    let broker = MemoryBroker::new();
    let endpoint = Arc::new(broker.endpoint());
    let dispatcher = PubSubDispatcher::start(endpoint.clone(), &settings).unwrap();
    Fixture {
        broker,
        endpoint,
        dispatcher,
    }
}

fn setup() -> Fixture {
    setup_with(PubSubSettings::default())
}

/// A handler forwarding every payload into a channel.
fn forwarding() -> (
    impl Fn(String) -> std::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: String| {
        let _ = tx.send(message);
        std::future::ready(Ok(()))
    };
    (handler, rx)
}

/// Memory transport whose next unsubscribe (or failing subscribe) parks
/// until the test releases it.
struct GatedTransport {
    inner: MemoryPubSub,
    hold_unsubscribe: AtomicBool,
    fail_subscribe: AtomicBool,
    entered: Semaphore,
    released: Semaphore,
}

impl GatedTransport {
    fn new(inner: MemoryPubSub) -> Self {
        Self {
            inner,
            hold_unsubscribe: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            entered: Semaphore::new(0),
            released: Semaphore::new(0),
        }
    }

    async fn park(&self) {
        self.entered.add_permits(1);
        self.released.acquire().await.unwrap().forget();
    }

    /// Wait until a call is parked.
    async fn parked(&self) {
        tokio::time::timeout(Duration::from_secs(1), self.entered.acquire())
            .await
            .expect("a transport call should be parked")
            .unwrap()
            .forget();
    }

    fn release(&self) {
        self.released.add_permits(1);
    }
}

#[async_trait]
impl PubSubTransport for GatedTransport {
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        if self.fail_subscribe.swap(false, Ordering::SeqCst) {
            self.park().await;
            return Err(StoreError::connection("subscribe refused"));
        }
        self.inner.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        if self.hold_unsubscribe.swap(false, Ordering::SeqCst) {
            self.park().await;
        }
        self.inner.unsubscribe(channel).await
    }

    fn take_messages(&self) -> Option<InboundStream> {
        self.inner.take_messages()
    }

    fn status(&self) -> PubSubStatus {
        self.inner.status()
    }

    async fn quit(&self) -> StoreResult<()> {
        self.inner.quit().await
    }
}

fn gated() -> (MemoryBroker, Arc<GatedTransport>, Arc<PubSubDispatcher>) {
    let broker = MemoryBroker::new();
    let transport = Arc::new(GatedTransport::new(broker.endpoint()));
    let dispatcher =
        PubSubDispatcher::start(transport.clone(), &PubSubSettings::default()).unwrap();
    (broker, transport, Arc::new(dispatcher))
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Give the drain task a chance to process everything already published.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn publish_serializes_payload_as_json() {
    let fx = setup();
    let (handler, mut rx) = forwarding();
    fx.dispatcher.on_channel_message("json", handler).await.unwrap();

    let receivers = fx
        .dispatcher
        .publish("json", &serde_json::json!({"id": 7}))
        .await
        .unwrap();
    assert_eq!(receivers, 1);
    assert_eq!(recv(&mut rx).await.as_deref(), Some(r#"{"id":7}"#));

    let receivers = fx.dispatcher.publish("json", "text").await.unwrap();
    assert_eq!(receivers, 1);
    assert_eq!(recv(&mut rx).await.as_deref(), Some(r#""text""#));
}

#[tokio::test]
async fn publish_without_subscribers_reports_zero() {
    let fx = setup();
    assert_eq!(fx.dispatcher.publish("nobody", &1).await.unwrap(), 0);
}

#[tokio::test]
async fn one_shot_fires_exactly_once() {
    let fx = setup();
    let (handler, mut rx) = forwarding();
    fx.dispatcher
        .once_channel_message("once", handler)
        .await
        .unwrap();
    assert_eq!(fx.broker.subscriber_count("once"), 1);

    fx.dispatcher.publish("once", &"first").await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some(r#""first""#));
    settle().await;

    // Unsubscribed before the handler ran
    assert_eq!(fx.broker.subscriber_count("once"), 0);
    assert_eq!(fx.dispatcher.registration("once"), None);

    assert_eq!(fx.dispatcher.publish("once", &"second").await.unwrap(), 0);
    assert_eq!(recv(&mut rx).await, None);
}

#[tokio::test]
async fn one_shot_with_burst_of_messages_fires_once() {
    let fx = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    fx.dispatcher
        .once_channel_message("burst", move |_m: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    // Published back to back, so all of them are queued before routing
    for i in 0..5 {
        fx.endpoint.publish("burst", &i.to_string()).await.unwrap();
    }
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_one_shot_registration_is_rejected() {
    let fx = setup();
    let (first, mut first_rx) = forwarding();
    let (second, mut second_rx) = forwarding();

    fx.dispatcher.once_channel_message("dup", first).await.unwrap();
    let err = fx
        .dispatcher
        .once_channel_message("dup", second)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PubSubError::HandlerAlreadyRegistered {
            existing: HandlerKind::OneShot,
            ..
        }
    ));

    fx.dispatcher.publish("dup", &"m").await.unwrap();
    assert_eq!(recv(&mut first_rx).await.as_deref(), Some(r#""m""#));
    assert_eq!(recv(&mut second_rx).await, None);
}

#[tokio::test]
async fn duplicate_persistent_registration_is_rejected() {
    let fx = setup();
    let (first, _first_rx) = forwarding();
    let (second, _second_rx) = forwarding();

    fx.dispatcher.on_channel_message("p", first).await.unwrap();
    let err = fx.dispatcher.on_channel_message("p", second).await.unwrap_err();
    assert!(err.is_already_registered());
    assert_eq!(fx.dispatcher.registration("p"), Some(HandlerKind::Persistent));
}

#[tokio::test]
async fn one_shot_then_persistent_is_rejected() {
    let fx = setup();
    let (once, _once_rx) = forwarding();
    let (persistent, _persistent_rx) = forwarding();

    fx.dispatcher.once_channel_message("mix", once).await.unwrap();
    let err = fx
        .dispatcher
        .on_channel_message("mix", persistent)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PubSubError::HandlerAlreadyRegistered {
            existing: HandlerKind::OneShot,
            ..
        }
    ));
}

#[tokio::test]
async fn persistent_handler_receives_every_message() {
    let fx = setup();
    let (handler, mut rx) = forwarding();
    fx.dispatcher.on_channel_message("feed", handler).await.unwrap();

    for i in 0..3 {
        fx.dispatcher.publish("feed", &i).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(recv(&mut rx).await.unwrap());
    }
    received.sort();
    assert_eq!(received, vec!["0", "1", "2"]);
    assert_eq!(fx.dispatcher.registration("feed"), Some(HandlerKind::Persistent));
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let fx = setup();
    fx.dispatcher.unsubscribe("never-registered").await.unwrap();
    fx.dispatcher.unsubscribe("never-registered").await.unwrap();

    let (handler, mut rx) = forwarding();
    fx.dispatcher.on_channel_message("feed", handler).await.unwrap();
    fx.dispatcher.unsubscribe("feed").await.unwrap();
    fx.dispatcher.unsubscribe("feed").await.unwrap();

    assert_eq!(fx.dispatcher.registration("feed"), None);
    assert_eq!(fx.dispatcher.publish("feed", &"m").await.unwrap(), 0);
    assert_eq!(recv(&mut rx).await, None);
}

#[tokio::test]
async fn channel_can_be_registered_again_after_unsubscribe() {
    let fx = setup();
    let (first, _first_rx) = forwarding();
    let (second, mut second_rx) = forwarding();

    fx.dispatcher.on_channel_message("c", first).await.unwrap();
    fx.dispatcher.unsubscribe("c").await.unwrap();
    fx.dispatcher.once_channel_message("c", second).await.unwrap();

    fx.dispatcher.publish("c", &"m").await.unwrap();
    assert_eq!(recv(&mut second_rx).await.as_deref(), Some(r#""m""#));
}

#[tokio::test]
async fn failing_handler_does_not_stop_dispatch() {
    let fx = setup();
    fx.dispatcher
        .on_channel_message("bad", |_m: String| async {
            Err::<(), HandlerError>(HandlerError::execution("boom"))
        })
        .await
        .unwrap();
    fx.dispatcher
        .on_channel_message("panics", |_m: String| async {
            if true {
                panic!("handler panic");
            }
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
    let (good, mut good_rx) = forwarding();
    fx.dispatcher.on_channel_message("good", good).await.unwrap();

    fx.dispatcher.publish("bad", &1).await.unwrap();
    fx.dispatcher.publish("panics", &1).await.unwrap();
    fx.dispatcher.publish("good", &1).await.unwrap();
    assert_eq!(recv(&mut good_rx).await.as_deref(), Some("1"));

    // Registrations survive handler failures
    fx.dispatcher.publish("bad", &2).await.unwrap();
    fx.dispatcher.publish("good", &2).await.unwrap();
    assert_eq!(recv(&mut good_rx).await.as_deref(), Some("2"));
    assert_eq!(fx.dispatcher.registration("bad"), Some(HandlerKind::Persistent));
    assert_eq!(fx.dispatcher.registration("panics"), Some(HandlerKind::Persistent));
}

#[tokio::test]
async fn slow_handler_times_out_without_blocking_others() {
    let fx = setup_with(PubSubSettings {
        handler_timeout_ms: 20,
    });
    fx.dispatcher
        .on_channel_message("slow", |_m: String| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
    let (good, mut good_rx) = forwarding();
    fx.dispatcher.on_channel_message("good", good).await.unwrap();

    fx.dispatcher.publish("slow", &1).await.unwrap();
    fx.dispatcher.publish("good", &1).await.unwrap();
    assert_eq!(recv(&mut good_rx).await.as_deref(), Some("1"));
}

#[tokio::test]
async fn unroutable_message_is_dropped() {
    let fx = setup();
    // Subscribe on the transport directly, bypassing registration
    fx.endpoint.subscribe("orphan").await.unwrap();
    assert_eq!(fx.endpoint.publish("orphan", "x").await.unwrap(), 1);
    settle().await;

    let (handler, mut rx) = forwarding();
    fx.dispatcher.on_channel_message("after", handler).await.unwrap();
    fx.dispatcher.publish("after", &"ok").await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some(r#""ok""#));
}

#[tokio::test]
async fn health_reports_pub_and_sub() {
    let fx = setup();
    assert!(fx.dispatcher.health().is_ok());

    fx.endpoint
        .set_state(ConnectionState::Ready, ConnectionState::Reconnecting);
    let health = fx.dispatcher.health();
    assert_eq!(health.status.code(), 503);
    assert_eq!(health.details.pubsub.subscriber, ConnectionState::Reconnecting);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["details"]["pubsub"]["pub"], "ready");
    assert_eq!(json["details"]["pubsub"]["sub"], "reconnecting");
}

#[tokio::test]
async fn shutdown_quits_transport() {
    let fx = setup();
    let (handler, _rx) = forwarding();
    fx.dispatcher.on_channel_message("c", handler).await.unwrap();

    fx.dispatcher.shutdown().await.unwrap();
    assert_eq!(fx.endpoint.status().publisher, ConnectionState::End);
    assert_eq!(fx.broker.subscriber_count("c"), 0);
    assert_eq!(fx.dispatcher.registration("c"), None);
}

#[tokio::test]
async fn one_shot_registered_again_during_teardown_stays_subscribed() {
    let (broker, transport, dispatcher) = gated();
    let (first, mut first_rx) = forwarding();
    dispatcher
        .once_channel_message("reply", first)
        .await
        .unwrap();

    transport.hold_unsubscribe.store(true, Ordering::SeqCst);
    dispatcher.publish("reply", &"one").await.unwrap();
    transport.parked().await;

    // The slot is free while the one-shot unsubscribe is still in flight
    let (second, mut second_rx) = forwarding();
    dispatcher
        .once_channel_message("reply", second)
        .await
        .unwrap();
    transport.release();

    assert_eq!(recv(&mut first_rx).await.as_deref(), Some(r#""one""#));
    settle().await;
    assert_eq!(broker.subscriber_count("reply"), 1);
    assert_eq!(dispatcher.registration("reply"), Some(HandlerKind::OneShot));

    assert_eq!(dispatcher.publish("reply", &"two").await.unwrap(), 1);
    assert_eq!(recv(&mut second_rx).await.as_deref(), Some(r#""two""#));
}

#[tokio::test]
async fn failed_subscribe_rolls_back_only_its_own_registration() {
    let (_broker, transport, dispatcher) = gated();
    transport.fail_subscribe.store(true, Ordering::SeqCst);

    let (first, _first_rx) = forwarding();
    let pending = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.on_channel_message("c", first).await })
    };
    transport.parked().await;

    dispatcher.unsubscribe("c").await.unwrap();
    let (second, mut second_rx) = forwarding();
    dispatcher.on_channel_message("c", second).await.unwrap();
    transport.release();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PubSubError::Transport(_)));
    assert_eq!(dispatcher.registration("c"), Some(HandlerKind::Persistent));

    dispatcher.publish("c", &"m").await.unwrap();
    assert_eq!(recv(&mut second_rx).await.as_deref(), Some(r#""m""#));
}

#[tokio::test]
async fn failed_subscribe_leaves_channel_free() {
    let (_broker, transport, dispatcher) = gated();
    transport.fail_subscribe.store(true, Ordering::SeqCst);
    transport.release();

    let (handler, _rx) = forwarding();
    let err = dispatcher.on_channel_message("c", handler).await.unwrap_err();
    assert!(matches!(err, PubSubError::Transport(_)));
    assert_eq!(dispatcher.registration("c"), None);
}

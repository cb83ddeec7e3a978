//! Integration tests for the Redis backend.
//!
//! These tests use testcontainers to spin up a real Redis instance, so they
//! need a Docker daemon and are ignored by default:
//!
//! ```text
//! cargo test -p tagstore-redis -- --ignored
//! ```

use futures_util::StreamExt;
use std::time::Duration;
use tagstore_core::{ConnectionState, KeyValueConnection, PubSubTransport};
use tagstore_redis::{ConnectionSettings, RedisPubSub, connect_pair};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn settings() -> ConnectionSettings {
    ConnectionSettings::new(get_redis_url().await)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_pair_connects_ready() {
    let settings = settings().await;
    let pair = connect_pair(&settings, &settings).await.expect("connect");

    let status = pair.status();
    assert_eq!(status.read_write, ConnectionState::Ready);
    assert_eq!(status.read_only, ConnectionState::Ready);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_strings_and_mget() {
    let settings = settings().await;
    let pair = connect_pair(&settings, &settings).await.expect("connect");
    let conn = &pair.read_write;

    conn.set("it:str:a", "1", None).await.unwrap();
    conn.set("it:str:b", "2", Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let values = pair
        .read_only
        .mget(&[
            "it:str:a".to_string(),
            "it:str:missing".to_string(),
            "it:str:b".to_string(),
        ])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Some("1".to_string()), None, Some("2".to_string())]
    );

    let removed = conn
        .del(&["it:str:a".to_string(), "it:str:b".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_millisecond_ttl_expires() {
    let settings = settings().await;
    let pair = connect_pair(&settings, &settings).await.expect("connect");
    let conn = &pair.read_write;

    conn.set("it:ttl", "v", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(conn.get("it:ttl").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(conn.get("it:ttl").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_compare_and_delete() {
    let settings = settings().await;
    let pair = connect_pair(&settings, &settings).await.expect("connect");
    let conn = &pair.read_write;

    assert!(
        conn.set_if_absent("it:lock", "token-a", Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert!(
        !conn
            .set_if_absent("it:lock", "token-b", Duration::from_secs(5))
            .await
            .unwrap()
    );

    assert!(!conn.delete_if_equals("it:lock", "token-b").await.unwrap());
    assert!(
        conn.pexpire_if_equals("it:lock", "token-a", Duration::from_secs(10))
            .await
            .unwrap()
    );
    assert!(conn.delete_if_equals("it:lock", "token-a").await.unwrap());
    assert!(conn.get("it:lock").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_hash_and_list_commands() {
    let settings = settings().await;
    let pair = connect_pair(&settings, &settings).await.expect("connect");
    let conn = &pair.read_write;

    let added = conn
        .hset(
            "it:hash",
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(added, 2);
    assert_eq!(conn.hlen("it:hash").await.unwrap(), 2);
    assert_eq!(conn.hget("it:hash", "a").await.unwrap().as_deref(), Some("1"));
    assert_eq!(conn.hdel("it:hash", &["a".to_string()]).await.unwrap(), 1);

    conn.del(&["it:list".to_string()]).await.unwrap();
    conn.lpush("it:list", &["x".to_string(), "y".to_string()])
        .await
        .unwrap();
    let items = conn.lrange("it:list", 0, -1).await.unwrap();
    assert_eq!(items, vec!["y".to_string(), "x".to_string()]);

    assert_eq!(conn.incr_by("it:counter:incr", 5).await.unwrap() % 5, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_pubsub_roundtrip() {
    let settings = settings().await;
    let transport = RedisPubSub::connect(&settings, &settings)
        .await
        .expect("connect pubsub");
    let mut messages = transport.take_messages().expect("inbound stream");
    assert!(transport.take_messages().is_none());

    transport.subscribe("it:channel").await.unwrap();
    let receivers = transport.publish("it:channel", "hello").await.unwrap();
    assert_eq!(receivers, 1);

    let message = tokio::time::timeout(Duration::from_secs(5), messages.next())
        .await
        .expect("message in time")
        .expect("stream open");
    assert_eq!(message.channel, "it:channel");
    assert_eq!(message.payload, "hello");

    transport.unsubscribe("it:channel").await.unwrap();
    assert_eq!(transport.publish("it:channel", "again").await.unwrap(), 0);

    transport.quit().await.unwrap();
    assert_eq!(transport.status().subscriber, ConnectionState::End);
}

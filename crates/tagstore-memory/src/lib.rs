//! In-process backend for tagstore.
//!
//! This crate provides implementations of the `KeyValueConnection` and
//! `PubSubTransport` traits from `tagstore-core` that live entirely in
//! memory, using `DashMap` for concurrent access. They back single-process
//! deployments and every test that does not need a real Redis.
//!
//! # Example
//!
//! ```ignore
//! use tagstore_memory::{MemoryBroker, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let pair = store.pair();
//! pair.read_write.set("greeting", "hello", None).await?;
//! assert_eq!(pair.read_only.get("greeting").await?, Some("hello".into()));
//!
//! let broker = MemoryBroker::new();
//! let transport = broker.endpoint();
//! ```

mod glob;
pub mod pubsub;
pub mod store;

pub use pubsub::{MemoryBroker, MemoryPubSub};
pub use store::{MemoryConnection, MemoryStore};

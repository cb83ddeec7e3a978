//! # tagstore-core
//!
//! Shared abstractions for the tagstore services.
//!
//! This crate defines the contract every backend must implement and the small
//! set of types that travel between layers. It contains no network code:
//! Redis lives in `tagstore-redis`, the in-process backend in `tagstore-memory`.
//!
//! ## Overview
//!
//! - [`KeyValueConnection`]: one logical path (read-write or read-only) to the store
//! - [`ConnectionPair`]: the write path plus the replica path, as used by the services
//! - [`PubSubTransport`]: publish/subscribe plumbing with a single inbound stream
//! - [`ConnectionState`]: the point-in-time state of a connection, used for health checks
//!
//! ## Example
//!
//! ```ignore
//! use tagstore_core::{ConnectionPair, StoreError};
//!
//! async fn read_through(
//!     pair: &ConnectionPair,
//!     key: &str,
//! ) -> Result<Option<String>, StoreError> {
//!     pair.read_only.get(key).await
//! }
//! ```

pub mod error;
pub mod pubsub;
pub mod status;
pub mod time;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use pubsub::{InboundMessage, InboundStream, PubSubTransport};
pub use status::{ConnectionRole, ConnectionState, PairStatus, PubSubStatus, StateCell};
pub use time::now_millis;
pub use traits::{ConnectionPair, DynConnection, KeyValueConnection, ScanPage};

//! Redis backend for tagstore.
//!
//! ## Connections
//!
//! - [`RedisConnection`]: one `ConnectionManager` serving either the
//!   read-write or the read-only path, with its state tracked for health checks
//! - [`RedisPubSub`]: publish over the read-write endpoint, subscribe over a
//!   dedicated pub/sub connection on the read-only endpoint
//!
//! ## Reconnection
//!
//! `ConnectionManager` reconnects on its own; the connection state flips to
//! `reconnecting` on the first failed command and back to `ready` on the next
//! success. The subscriber connection is owned by a background actor that
//! reconnects with exponential backoff and resubscribes every active channel.

pub mod connection;
pub mod pubsub;
pub mod settings;

pub use connection::{RedisConnection, connect_pair};
pub use pubsub::RedisPubSub;
pub use settings::ConnectionSettings;

//! Connection states reported by backends and consumed by health checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Point-in-time state of a single connection.
///
/// Mirrors the lifecycle of a client connection: created (`Wait`), dialing
/// (`Connecting`), socket open (`Connect`), handshake done (`Ready`), lost and
/// retrying (`Reconnecting`), closing (`Close`) and closed for good (`End`).
/// Only [`ConnectionState::Ready`] counts as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Wait,
    Connecting,
    Connect,
    Ready,
    Reconnecting,
    Close,
    End,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Wait => "wait",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connect => "connect",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Close => "close",
            ConnectionState::End => "end",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Wait,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connect,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Reconnecting,
            5 => ConnectionState::Close,
            _ => ConnectionState::End,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free cell holding a [`ConnectionState`].
///
/// Cloning yields another handle to the same state, so a background task can
/// update what `status()` reports.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_u8())))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state.to_u8(), Ordering::AcqRel))
    }
}

/// Which of the two store paths a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    ReadWrite,
    ReadOnly,
}

impl ConnectionRole {
    /// Label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionRole::ReadWrite => "READ-WRITE",
            ConnectionRole::ReadOnly => "READ-ONLY",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// States of a write/replica connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairStatus {
    pub read_write: ConnectionState,
    pub read_only: ConnectionState,
}

impl PairStatus {
    pub fn is_ready(&self) -> bool {
        self.read_write.is_ready() && self.read_only.is_ready()
    }
}

/// States of the publish and subscribe connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubStatus {
    #[serde(rename = "pub")]
    pub publisher: ConnectionState,
    #[serde(rename = "sub")]
    pub subscriber: ConnectionState,
}

impl PubSubStatus {
    pub fn is_ready(&self) -> bool {
        self.publisher.is_ready() && self.subscriber.is_ready()
    }
}

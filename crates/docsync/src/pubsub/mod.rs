//! Publish/subscribe transport used for cross-instance replication
//!
//! Every transport hands out exactly one inbound stream of pattern messages.
//! Publishing and subscribing never block on that stream.

mod memory;
mod redis;

pub use memory::{MemoryBroker, MemoryPubSub};
pub use redis::RedisPubSub;

use crate::resp::RespError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("RESP error: {0}")]
    Resp(#[from] RespError),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Transport disconnected")]
    Disconnected,
    #[error("Timed out waiting for confirmation")]
    Timeout,
    #[error("Broker unavailable")]
    Unavailable,
}

/// A payload delivered because its channel matched a subscribed pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMessage {
    pub pattern: String,
    pub channel: String,
    pub payload: Bytes,
}

pub type MessageStream = mpsc::UnboundedReceiver<PatternMessage>;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Resolves once the broker confirmed the subscription
    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// The inbound stream; `None` once it has been taken
    fn take_messages(&self) -> Option<MessageStream>;

    async fn disconnect(&self);
}

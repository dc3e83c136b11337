use super::{MessageStream, PatternMessage, PubSub, TransportError};
use crate::types::glob_match;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

struct Subscriber {
    patterns: BTreeSet<String>,
    sender: mpsc::UnboundedSender<PatternMessage>,
}

struct BrokerInner {
    available: AtomicBool,
    next_client: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// In-process broker shared by several instances
///
/// Delivers one message per matching pattern, like Redis does for
/// overlapping pattern subscriptions. Used by tests and the dev cluster.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                available: AtomicBool::new(true),
                next_client: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connect a new client with its own inbound stream
    pub async fn client(&self) -> MemoryPubSub {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().await.insert(
            id,
            Subscriber {
                patterns: BTreeSet::new(),
                sender,
            },
        );
        MemoryPubSub {
            id,
            broker: self.clone(),
            messages: StdMutex::new(Some(receiver)),
        }
    }

    /// Simulate the broker going away; every operation fails while false
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, TransportError> {
        self.check_available()?;
        let subscribers = self.inner.subscribers.lock().await;
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            for pattern in subscriber.patterns.iter() {
                if !glob_match(pattern, channel) {
                    continue;
                }
                let message = PatternMessage {
                    pattern: pattern.clone(),
                    channel: channel.to_string(),
                    payload: payload.clone(),
                };
                // A dropped stream just means nobody reads this client anymore
                if subscriber.sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!("Published to {} ({} receivers)", channel, delivered);
        Ok(delivered)
    }
}

/// Client handle onto a [`MemoryBroker`]
pub struct MemoryPubSub {
    id: u64,
    broker: MemoryBroker,
    messages: StdMutex<Option<MessageStream>>,
}

impl MemoryPubSub {
    /// Patterns this client is currently subscribed to, sorted
    pub async fn subscriptions(&self) -> Vec<String> {
        self.broker
            .inner
            .subscribers
            .lock()
            .await
            .get(&self.id)
            .map(|s| s.patterns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, pattern: &str) -> bool {
        self.broker
            .inner
            .subscribers
            .lock()
            .await
            .get(&self.id)
            .is_some_and(|s| s.patterns.contains(pattern))
    }

    async fn update_patterns<F>(&self, f: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        self.broker.check_available()?;
        let mut subscribers = self.broker.inner.subscribers.lock().await;
        let subscriber = subscribers
            .get_mut(&self.id)
            .ok_or(TransportError::Disconnected)?;
        f(&mut subscriber.patterns);
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.broker.inner.subscribers.lock().await.contains_key(&self.id) {
            return Err(TransportError::Disconnected);
        }
        self.broker.publish(channel, payload).await.map(|_| ())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.update_patterns(|patterns| {
            patterns.insert(pattern.to_string());
        })
        .await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.update_patterns(|patterns| {
            patterns.remove(pattern);
        })
        .await
    }

    fn take_messages(&self) -> Option<MessageStream> {
        self.messages.lock().ok().and_then(|mut messages| messages.take())
    }

    async fn disconnect(&self) {
        self.broker.inner.subscribers.lock().await.remove(&self.id);
    }
}

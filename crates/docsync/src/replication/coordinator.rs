use super::{Origin, ReplicationError, receive};
use crate::awareness::AwarenessChanges;
use crate::codec::{Envelope, Message, SyncFrame};
use crate::config::Config;
use crate::document::{Document, DocumentState};
use crate::lock::{LockError, LockHandle, LockService};
use crate::pubsub::{PatternMessage, PubSub};
use crate::registry::DocumentRegistry;
use crate::types::{ChannelKeys, InstanceId, is_echo};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub lock_ttl: Duration,
    /// Grace window before an unused document is unsubscribed
    pub disconnect_delay: Duration,
    /// Awareness states not renewed for this long are dropped
    pub awareness_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_ttl: config.lock.ttl(),
            disconnect_delay: config.lifecycle.disconnect_delay(),
            awareness_timeout: config.lifecycle.awareness_timeout(),
        }
    }
}

/// Whether a persistence cycle may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistDecision {
    Proceed,
    /// Another instance holds the document lock
    Skip,
}

/// Keeps the documents of this process in sync with every other instance
///
/// One per process, shared through `Arc`. Owns the instance identifier, the
/// locks currently held for persistence and the per-document subscriptions.
/// Callers pass documents in already locked; the coordinator only takes the
/// registry lock after a document lock, never the other way round.
pub struct ReplicationCoordinator {
    identifier: InstanceId,
    keys: ChannelKeys,
    registry: Arc<DocumentRegistry>,
    pubsub: Arc<dyn PubSub>,
    locks: Arc<dyn LockService>,
    held_locks: Mutex<HashMap<String, LockHandle>>,
    settings: CoordinatorSettings,
    awareness_sweep: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicationCoordinator {
    pub fn new(
        identifier: InstanceId,
        keys: ChannelKeys,
        registry: Arc<DocumentRegistry>,
        pubsub: Arc<dyn PubSub>,
        locks: Arc<dyn LockService>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            identifier,
            keys,
            registry,
            pubsub,
            locks,
            held_locks: Mutex::new(HashMap::new()),
            settings,
            awareness_sweep: StdMutex::new(None),
        }
    }

    pub fn identifier(&self) -> &InstanceId {
        &self.identifier
    }

    pub fn keys(&self) -> &ChannelKeys {
        &self.keys
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Spawn the task consuming inbound replication messages in order, and
    /// the periodic awareness expiry
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ReplicationError> {
        let mut messages = self
            .pubsub
            .take_messages()
            .ok_or(ReplicationError::AlreadyStarted)?;
        let coordinator = Arc::clone(self);
        info!("Replication started for instance {}", self.identifier);

        let sweep = tokio::spawn(sweep_awareness(
            Arc::downgrade(self),
            self.settings.awareness_timeout / 10,
        ));
        if let Ok(mut slot) = self.awareness_sweep.lock() {
            *slot = Some(sweep);
        }

        Ok(tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                coordinator.on_inbound_message(message).await;
            }
            debug!("Replication stream closed");
        }))
    }

    /// Join the replication mesh for `document`
    ///
    /// Subscription failure leaves the document inactive and is returned.
    /// The initial sync and awareness query are best effort.
    pub async fn on_document_activated(
        &self,
        document: &mut Document,
    ) -> Result<(), ReplicationError> {
        document.set_state(DocumentState::Subscribing);
        let pattern = self.keys.subscribe_pattern(document.name());
        if let Err(source) = self.pubsub.psubscribe(&pattern).await {
            document.set_state(DocumentState::Inactive);
            return Err(ReplicationError::Subscribe {
                document: document.name().to_string(),
                source,
            });
        }
        document.set_state(DocumentState::Active);
        debug!("Subscribed to {}", pattern);

        let step1 = Message::Sync(SyncFrame::Step1(document.state_vector()));
        self.publish(document.name(), step1).await;
        self.publish(document.name(), Message::QueryAwareness).await;
        Ok(())
    }

    pub async fn on_inbound_message(&self, message: PatternMessage) {
        let Some(channel) = self.keys.parse(&message.channel) else {
            debug!("Ignoring message on foreign channel {}", message.channel);
            return;
        };
        if is_echo(&channel, &self.identifier) {
            trace!("Dropping own message on {}", message.channel);
            return;
        }
        let Some(shared) = self.registry.get(channel.document_name).await else {
            trace!("No local document for {}", message.channel);
            return;
        };

        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed message on {}: {}", message.channel, e);
                return;
            }
        };
        if envelope.document_name != channel.document_name {
            warn!(
                "Message for {} arrived on {}",
                envelope.document_name, message.channel
            );
            return;
        }

        let mut document = shared.lock().await;
        if document.state() != DocumentState::Active {
            trace!("Document {} not active, dropping message", document.name());
            return;
        }

        let outcome = match receive(&mut document, envelope.message, Origin::Peer) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to apply message from {}: {}", channel.instance_id, e);
                return;
            }
        };
        for reply in outcome.replies {
            self.publish(document.name(), reply).await;
        }
        if outcome.changed {
            self.on_local_mutation(&document).await;
        }
    }

    /// Announce the new state after the document gained information
    ///
    /// Publishes a sync step 1; every peer answers with what we lack and
    /// asks back for what it lacks, so the handshake settles once the
    /// replicas agree.
    pub async fn on_local_mutation(&self, document: &Document) {
        let step1 = Message::Sync(SyncFrame::Step1(document.state_vector()));
        self.publish(document.name(), step1).await;
    }

    pub async fn on_awareness_changed(&self, document: &Document, changes: &AwarenessChanges) {
        if changes.is_empty() {
            return;
        }
        let update = document
            .awareness()
            .encode_update(&changes.changed_clients())
            .encode();
        self.publish(document.name(), Message::Awareness(update))
            .await;
    }

    /// Drop awareness states that were not renewed in time, in every loaded
    /// document, and tell local clients
    ///
    /// Peers run the same expiry on their own, so removals are not
    /// published. Returns the number of expired states.
    pub async fn expire_awareness(&self, now: Instant) -> usize {
        let mut expired = 0;
        for name in self.registry.names().await {
            let Some(shared) = self.registry.get(&name).await else {
                continue;
            };
            let mut document = shared.lock().await;
            let changes = document
                .awareness_mut()
                .remove_outdated(now, self.settings.awareness_timeout);
            if changes.is_empty() {
                continue;
            }
            debug!("Expired awareness of {:?} on {}", changes.removed, name);
            let update = document
                .awareness()
                .encode_update(&changes.changed_clients())
                .encode();
            document.broadcast(None, &Envelope::new(name.as_str(), Message::Awareness(update)));
            expired += changes.removed.len();
        }
        expired
    }

    pub async fn on_broadcast_stateless(&self, document_name: &str, payload: &str) {
        self.publish(
            document_name,
            Message::BroadcastStateless(payload.to_string()),
        )
        .await;
    }

    /// Take the document lock for one persistence cycle
    pub async fn on_before_persist(&self, document_name: &str) -> PersistDecision {
        let resource = self.keys.lock_key(document_name);
        match self.locks.acquire(&resource, self.settings.lock_ttl).await {
            Ok(handle) => {
                let previous = self
                    .held_locks
                    .lock()
                    .await
                    .insert(document_name.to_string(), handle);
                if let Some(previous) = previous {
                    self.release(previous).await;
                }
                PersistDecision::Proceed
            }
            Err(LockError::Contended(_)) => {
                debug!("{} is being stored by another instance", document_name);
                PersistDecision::Skip
            }
            Err(e) => {
                warn!("Could not lock {}: {}", resource, e);
                PersistDecision::Skip
            }
        }
    }

    pub async fn on_after_persist(&self, document_name: &str) {
        let handle = self.held_locks.lock().await.remove(document_name);
        if let Some(handle) = handle {
            self.release(handle).await;
        }
    }

    /// Schedule the idle check for a document that lost its last connection
    ///
    /// Nothing cancels the timer; a reconnection is noticed when it fires.
    pub fn on_last_local_connection_closed(self: &Arc<Self>, document_name: &str) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let name = document_name.to_string();
        let delay = self.settings.disconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.unsubscribe_if_idle(&name).await;
        })
    }

    /// Unsubscribe and evict `document_name` if it has no local connections
    pub async fn unsubscribe_if_idle(&self, document_name: &str) -> bool {
        let Some(shared) = self.registry.get(document_name).await else {
            return false;
        };
        let mut document = shared.lock().await;
        if document.connection_count() > 0 {
            debug!("{} reconnected, keeping subscription", document_name);
            return false;
        }

        // Unsubscribe before eviction so a replacement document can only
        // subscribe after us
        let pattern = self.keys.subscribe_pattern(document_name);
        if document.state() != DocumentState::Inactive {
            if let Err(e) = self.pubsub.punsubscribe(&pattern).await {
                warn!("Failed to unsubscribe {}: {}", pattern, e);
            }
        }
        document.set_state(DocumentState::Inactive);
        self.registry.remove_if_same(document_name, &shared).await;
        info!("Unloaded {}", document_name);
        true
    }

    /// Release held locks and close transports, ignoring every error
    pub async fn on_shutdown(&self) {
        if let Some(sweep) = self.awareness_sweep.lock().ok().and_then(|mut slot| slot.take()) {
            sweep.abort();
        }
        let handles: Vec<_> = self.held_locks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.release(handle).await;
        }
        self.locks.quit().await;
        self.pubsub.disconnect().await;
        info!("Replication stopped for instance {}", self.identifier);
    }

    async fn release(&self, handle: LockHandle) {
        if let Err(e) = self.locks.release(&handle).await {
            debug!("Lock release for {} failed: {}", handle.resource(), e);
        }
    }

    async fn publish(&self, document_name: &str, message: Message) {
        let channel = self.keys.publish_key(document_name, &self.identifier);
        let payload = Bytes::from(Envelope::new(document_name, message).encode());
        if let Err(e) = self.pubsub.publish(&channel, payload).await {
            warn!("Failed to publish on {}: {}", channel, e);
        }
    }
}

async fn sweep_awareness(coordinator: Weak<ReplicationCoordinator>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        coordinator.expire_awareness(Instant::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{MemoryLockNode, Redlock, RedlockSettings};
    use crate::pubsub::{MemoryBroker, MemoryPubSub};

    async fn coordinator(broker: &MemoryBroker, node: &MemoryLockNode) -> Arc<ReplicationCoordinator> {
        let pubsub = Arc::new(broker.client().await);
        let locks = Redlock::new(
            vec![Arc::new(node.clone())],
            RedlockSettings {
                retry_count: 2,
                retry_delay: Duration::from_millis(10),
                drift_factor: 0.01,
            },
        );
        Arc::new(ReplicationCoordinator::new(
            InstanceId::generate(),
            ChannelKeys::new("test"),
            Arc::new(DocumentRegistry::new()),
            pubsub,
            Arc::new(locks),
            CoordinatorSettings {
                lock_ttl: Duration::from_millis(1000),
                disconnect_delay: Duration::from_millis(20),
                awareness_timeout: Duration::from_millis(200),
            },
        ))
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker, &MemoryLockNode::new()).await;
        coordinator.start().unwrap();
        assert!(matches!(
            coordinator.start(),
            Err(ReplicationError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_activation_publishes_step1_and_awareness_query() {
        let broker = MemoryBroker::new();
        let observer: MemoryPubSub = broker.client().await;
        let mut seen = observer.take_messages().unwrap();
        observer.psubscribe("test:doc:*").await.unwrap();

        let coordinator = coordinator(&broker, &MemoryLockNode::new()).await;
        let mut document = Document::new("doc");
        coordinator.on_document_activated(&mut document).await.unwrap();
        assert_eq!(document.state(), DocumentState::Active);

        let first = Envelope::decode(&seen.recv().await.unwrap().payload).unwrap();
        assert!(matches!(first.message, Message::Sync(SyncFrame::Step1(_))));
        let second = seen.recv().await.unwrap();
        assert_eq!(
            second.channel,
            format!("test:doc:{}", coordinator.identifier())
        );
        assert_eq!(
            Envelope::decode(&second.payload).unwrap().message,
            Message::QueryAwareness
        );
    }

    #[tokio::test]
    async fn test_local_mutation_publishes_first_sync_step() {
        let broker = MemoryBroker::new();
        let observer: MemoryPubSub = broker.client().await;
        let mut seen = observer.take_messages().unwrap();
        observer.psubscribe("test:doc:*").await.unwrap();

        let coordinator = coordinator(&broker, &MemoryLockNode::new()).await;
        let mut document = Document::new("doc");
        let source = Document::new("doc");
        {
            use yrs::{Text, Transact, WriteTxn};
            let mut txn = source.doc().transact_mut();
            txn.get_or_insert_text("content").insert(&mut txn, 0, "x");
        }
        document
            .apply_update(&source.encode_state_as_update())
            .unwrap();
        coordinator.on_local_mutation(&document).await;

        let published = Envelope::decode(&seen.recv().await.unwrap().payload).unwrap();
        assert_eq!(
            published.message,
            Message::Sync(SyncFrame::Step1(document.state_vector()))
        );
    }

    #[tokio::test]
    async fn test_expired_awareness_is_removed_and_sent_to_local_clients() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker, &MemoryLockNode::new()).await;
        let (shared, _) = coordinator.registry().get_or_create("doc").await;
        let mut clients = {
            let mut document = shared.lock().await;
            document.awareness_mut().set_local_state(5, serde_json::json!({"name": "ada"}));
            document.subscribe_clients()
        };

        assert_eq!(coordinator.expire_awareness(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(coordinator.expire_awareness(later).await, 1);
        assert!(shared.lock().await.awareness().is_empty());

        let frame = clients.recv().await.unwrap();
        assert_eq!(frame.origin, None);
        let envelope = Envelope::decode(&frame.payload).unwrap();
        let Message::Awareness(data) = envelope.message else {
            panic!("expected an awareness frame");
        };
        let update = crate::awareness::AwarenessUpdate::decode(&data).unwrap();
        assert_eq!(update.entries.len(), 1);
        assert!(update.entries[0].state.is_none());
    }

    #[tokio::test]
    async fn test_sweep_expires_awareness_until_shutdown() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker, &MemoryLockNode::new()).await;
        coordinator.start().unwrap();
        let (shared, _) = coordinator.registry().get_or_create("doc").await;
        shared
            .lock()
            .await
            .awareness_mut()
            .set_local_state(5, serde_json::json!("here"));

        for _ in 0..100 {
            if shared.lock().await.awareness().is_empty() {
                coordinator.on_shutdown().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("awareness state was never expired");
    }

    #[tokio::test]
    async fn test_persist_lock_is_held_until_after_persist() {
        let broker = MemoryBroker::new();
        let node = MemoryLockNode::new();
        let a = coordinator(&broker, &node).await;
        let b = coordinator(&broker, &node).await;

        assert_eq!(a.on_before_persist("doc").await, PersistDecision::Proceed);
        assert!(node.holder("test:doc:lock").await.is_some());
        assert_eq!(b.on_before_persist("doc").await, PersistDecision::Skip);

        a.on_after_persist("doc").await;
        assert!(node.holder("test:doc:lock").await.is_none());
        assert_eq!(b.on_before_persist("doc").await, PersistDecision::Proceed);
        b.on_shutdown().await;
        assert!(node.holder("test:doc:lock").await.is_none());
    }
}

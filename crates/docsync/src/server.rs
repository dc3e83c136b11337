use crate::awareness::ClientId;
use crate::codec::{CodecError, Envelope, Message, SyncFrame};
use crate::backend::Transports;
use crate::config::{Config, PersistenceConfig};
use crate::document::{ClientFrame, ConnectionId, DocumentState, SharedDocument};
use crate::persistence::{PersistenceAdapter, PersistenceError};
use crate::registry::DocumentRegistry;
use crate::replication::{
    CoordinatorSettings, Origin, PersistDecision, ReplicationCoordinator, ReplicationError,
    receive,
};
use crate::storage::StorageBackend;
use crate::types::{ChannelKeys, InstanceId};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Frame for {actual} sent on connection to {expected}")]
    WrongDocument { expected: String, actual: String },
}

/// Result of one persistence cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Another instance holds the document lock
    Skipped,
    Failed,
    /// Document not loaded here
    Missing,
}

/// Frames from other connections to the same document
pub struct ClientSubscription {
    connection_id: ConnectionId,
    receiver: broadcast::Receiver<ClientFrame>,
}

impl ClientSubscription {
    /// Next encoded envelope for this connection; `None` once the document
    /// is dropped
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) if frame.origin == Some(self.connection_id) => continue,
                Ok(frame) => return Some(frame.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Connection {} lagged, {} frames dropped",
                        self.connection_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// One local client attached to one document
pub struct ClientConnection {
    id: ConnectionId,
    document_name: String,
    document: SharedDocument,
    /// Awareness clients announced over this connection
    owned_clients: HashSet<ClientId>,
    initial_frames: Vec<Envelope>,
    subscription: Option<ClientSubscription>,
}

impl ClientConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    /// Sync step 1 and current awareness, to send right after connecting
    pub fn take_initial_frames(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.initial_frames)
    }

    pub fn take_subscription(&mut self) -> Option<ClientSubscription> {
        self.subscription.take()
    }
}

struct PendingStore {
    generation: u64,
    first_change: Instant,
}

/// Lifecycle glue between local clients, persistence and replication
///
/// Client frames are applied under the document lock and fanned out to the
/// other local connections; changes go to the coordinator for replication
/// and schedule a debounced store.
pub struct DocumentServer {
    registry: Arc<DocumentRegistry>,
    coordinator: Arc<ReplicationCoordinator>,
    persistence: PersistenceAdapter,
    debounce: Duration,
    max_debounce: Duration,
    next_connection: AtomicU64,
    pending_stores: Mutex<HashMap<String, PendingStore>>,
}

impl DocumentServer {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        persistence: PersistenceAdapter,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            registry: Arc::clone(coordinator.registry()),
            coordinator,
            persistence,
            debounce: config.debounce(),
            max_debounce: config.max_debounce(),
            next_connection: AtomicU64::new(1),
            pending_stores: Mutex::new(HashMap::new()),
        }
    }

    /// Wire a coordinator over `transports` and start consuming replication
    /// messages
    pub fn launch(
        config: &Config,
        identifier: InstanceId,
        transports: Transports,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let coordinator = Arc::new(ReplicationCoordinator::new(
            identifier,
            ChannelKeys::new(config.instance.prefix.clone()),
            Arc::new(DocumentRegistry::new()),
            transports.pubsub,
            transports.locks,
            CoordinatorSettings::from_config(config),
        ));
        coordinator.start()?;
        Ok(Arc::new(Self::new(
            coordinator,
            PersistenceAdapter::new(backend),
            &config.persistence,
        )))
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    /// Attach a new local connection to `document_name`
    ///
    /// The first connection loads the document and joins replication. If
    /// either fails the document is evicted again and the error returned.
    pub async fn connect(&self, document_name: &str) -> Result<ClientConnection, ServerError> {
        loop {
            let (shared, created) = self.registry.get_or_create(document_name).await;
            let mut document = shared.lock().await;
            if !self.registry.contains_same(document_name, &shared).await {
                // Evicted while we waited for it
                continue;
            }

            document.add_connection();
            if document.state() == DocumentState::Inactive {
                debug!("Loading {} (created: {})", document_name, created);
                let activated = match self.persistence.load(&mut document).await {
                    Ok(_) => self
                        .coordinator
                        .on_document_activated(&mut document)
                        .await
                        .map_err(ServerError::from),
                    Err(e) => Err(ServerError::from(e)),
                };
                if let Err(e) = activated {
                    document.remove_connection();
                    document.set_state(DocumentState::Inactive);
                    self.registry.remove_if_same(document_name, &shared).await;
                    error!("Failed to open {}: {}", document_name, e);
                    return Err(e);
                }
            }

            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let mut initial_frames = vec![Envelope::new(
                document_name,
                Message::Sync(SyncFrame::Step1(document.state_vector())),
            )];
            if !document.awareness().is_empty() {
                initial_frames.push(Envelope::new(
                    document_name,
                    Message::Awareness(document.awareness().full_update().encode()),
                ));
            }
            let subscription = ClientSubscription {
                connection_id: id,
                receiver: document.subscribe_clients(),
            };
            info!(
                "Connection {} opened {} ({} local)",
                id,
                document_name,
                document.connection_count()
            );
            drop(document);

            return Ok(ClientConnection {
                id,
                document_name: document_name.to_string(),
                document: shared,
                owned_clients: HashSet::new(),
                initial_frames,
                subscription: Some(subscription),
            });
        }
    }

    /// Decode and handle one frame from a client, returning direct replies
    pub async fn handle_frame(
        self: &Arc<Self>,
        connection: &mut ClientConnection,
        frame: &[u8],
    ) -> Result<Vec<Envelope>, ServerError> {
        let envelope = Envelope::decode(frame)?;
        self.handle_envelope(connection, envelope).await
    }

    pub async fn handle_envelope(
        self: &Arc<Self>,
        connection: &mut ClientConnection,
        envelope: Envelope,
    ) -> Result<Vec<Envelope>, ServerError> {
        if envelope.document_name != connection.document_name {
            return Err(ServerError::WrongDocument {
                expected: connection.document_name.clone(),
                actual: envelope.document_name,
            });
        }

        let (changed, replies) = {
            let mut document = connection.document.lock().await;
            let outcome = receive(
                &mut document,
                envelope.message,
                Origin::Client(connection.id),
            )
            .map_err(ServerError::from)?;

            if outcome.changed {
                self.coordinator.on_local_mutation(&document).await;
            }
            if let Some(update) = &outcome.awareness_update {
                for entry in &update.entries {
                    if entry.state.is_some() {
                        connection.owned_clients.insert(entry.client_id);
                    } else {
                        connection.owned_clients.remove(&entry.client_id);
                    }
                }
            }
            self.coordinator
                .on_awareness_changed(&document, &outcome.awareness)
                .await;
            if let Some(payload) = &outcome.broadcast_stateless {
                self.coordinator
                    .on_broadcast_stateless(&connection.document_name, payload)
                    .await;
            }

            let replies = outcome
                .replies
                .into_iter()
                .map(|message| Envelope::new(connection.document_name.as_str(), message))
                .collect::<Vec<_>>();
            (outcome.changed, replies)
        };

        if changed {
            self.schedule_store(&connection.document_name).await;
        }
        Ok(replies)
    }

    /// Detach a connection; the last one flushes pending changes and starts
    /// the unload timer
    pub async fn disconnect(&self, connection: ClientConnection) -> Option<JoinHandle<()>> {
        let name = connection.document_name.as_str();
        let remaining = {
            let mut document = connection.document.lock().await;
            let owned: Vec<_> = connection.owned_clients.iter().copied().collect();
            let changes = document.awareness_mut().remove_states(&owned);
            if !changes.is_empty() {
                let update = document
                    .awareness()
                    .encode_update(&changes.changed_clients())
                    .encode();
                document.broadcast(
                    Some(connection.id),
                    &Envelope::new(name, Message::Awareness(update)),
                );
                self.coordinator
                    .on_awareness_changed(&document, &changes)
                    .await;
            }
            document.remove_connection()
        };
        info!(
            "Connection {} closed {} ({} local)",
            connection.id, name, remaining
        );

        if remaining > 0 {
            return None;
        }
        self.flush_store(name).await;
        Some(self.coordinator.on_last_local_connection_closed(name))
    }

    /// Store `document_name` under the distributed lock
    pub async fn store_document(&self, document_name: &str) -> StoreOutcome {
        let Some(shared) = self.registry.get(document_name).await else {
            return StoreOutcome::Missing;
        };
        if self.coordinator.on_before_persist(document_name).await == PersistDecision::Skip {
            return StoreOutcome::Skipped;
        }

        let state = shared.lock().await.encode_state_as_update();
        let outcome = match self.persistence.store(document_name, &state).await {
            Ok(()) => StoreOutcome::Stored,
            Err(e) => {
                error!("Failed to store {}: {}", document_name, e);
                StoreOutcome::Failed
            }
        };
        self.coordinator.on_after_persist(document_name).await;
        outcome
    }

    /// Store after `debounce`, but no later than `max_debounce` after the
    /// first unsaved change
    async fn schedule_store(self: &Arc<Self>, document_name: &str) {
        let now = Instant::now();
        let (generation, delay) = {
            let mut pending = self.pending_stores.lock().await;
            let entry = pending
                .entry(document_name.to_string())
                .or_insert(PendingStore {
                    generation: 0,
                    first_change: now,
                });
            entry.generation += 1;
            let deadline = entry.first_change + self.max_debounce;
            (
                entry.generation,
                self.debounce.min(deadline.saturating_duration_since(now)),
            )
        };

        let server = Arc::clone(self);
        let name = document_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if server.take_pending(&name, Some(generation)).await {
                server.store_document(&name).await;
            }
        });
    }

    /// Remove the pending entry; with a generation, only if it still matches
    async fn take_pending(&self, document_name: &str, generation: Option<u64>) -> bool {
        let mut pending = self.pending_stores.lock().await;
        match pending.get(document_name) {
            Some(entry) if generation.is_none_or(|g| g == entry.generation) => {
                pending.remove(document_name);
                true
            }
            _ => false,
        }
    }

    /// Store right away if a store is pending
    pub async fn flush_store(&self, document_name: &str) -> Option<StoreOutcome> {
        if self.take_pending(document_name, None).await {
            Some(self.store_document(document_name).await)
        } else {
            None
        }
    }

    pub async fn has_pending_store(&self, document_name: &str) -> bool {
        self.pending_stores.lock().await.contains_key(document_name)
    }

    /// Flush pending stores, then release locks and close transports
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.pending_stores.lock().await.keys().cloned().collect();
        for name in names {
            self.flush_store(&name).await;
        }
        self.coordinator.on_shutdown().await;
    }
}

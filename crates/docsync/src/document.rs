use crate::awareness::Awareness;
use crate::codec::Envelope;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Identifier of a local client connection
pub type ConnectionId = u64;

/// Frames buffered per local connection before it starts lagging
const CLIENT_CHANNEL_CAPACITY: usize = 256;

pub type SharedDocument = Arc<Mutex<Document>>;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Malformed CRDT payload: {0}")]
    Decode(#[from] yrs::encoding::read::Error),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// Replication state of a document in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    /// Not joined to the replication mesh
    Inactive,
    /// Pattern subscription in flight
    Subscribing,
    Active,
}

/// Frame fanned out to local connections
#[derive(Debug, Clone)]
pub struct ClientFrame {
    /// Connection the frame came from, if any; that connection skips it
    pub origin: Option<ConnectionId>,
    pub payload: Bytes,
}

/// Live in-memory replica of one shared document
///
/// CRDT state is only touched through apply/encode; the rest is local
/// bookkeeping (awareness, attached connections, replication state).
pub struct Document {
    name: String,
    doc: Doc,
    awareness: Awareness,
    connections: usize,
    state: DocumentState,
    clients: broadcast::Sender<ClientFrame>,
}

impl Document {
    pub fn new(name: impl Into<String>) -> Self {
        let (clients, _) = broadcast::channel(CLIENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            doc: Doc::new(),
            awareness: Awareness::new(),
            connections: 0,
            state: DocumentState::Inactive,
            clients,
        }
    }

    pub fn shared(name: impl Into<String>) -> SharedDocument {
        Arc::new(Mutex::new(Self::new(name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying CRDT document, for local edits
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn set_state(&mut self, state: DocumentState) {
        trace!("Document {} state {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }

    pub fn connection_count(&self) -> usize {
        self.connections
    }

    pub fn add_connection(&mut self) -> usize {
        self.connections += 1;
        self.connections
    }

    /// Returns the remaining connection count
    pub fn remove_connection(&mut self) -> usize {
        self.connections = self.connections.saturating_sub(1);
        self.connections
    }

    /// Encoded state vector (payload of a sync step 1)
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full state as a single update (the snapshot that gets persisted)
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything a peer with the given state vector is missing
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// Merge an update, returning whether it carried new information
    ///
    /// Applying the same update twice is a no-op, which is what makes
    /// duplicated or reordered replication safe.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<bool, DocumentError> {
        let update = Update::decode_v1(update)?;
        let before = self.encode_state_as_update();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        Ok(self.encode_state_as_update() != before)
    }

    /// Receiver for frames destined to local connections
    pub fn subscribe_clients(&self) -> broadcast::Receiver<ClientFrame> {
        self.clients.subscribe()
    }

    /// Send a frame to every local connection except `origin`
    pub fn broadcast(&self, origin: Option<ConnectionId>, envelope: &Envelope) -> usize {
        let frame = ClientFrame {
            origin,
            payload: Bytes::from(envelope.encode()),
        };
        // No receivers just means no local connections
        self.clients.send(frame).unwrap_or(0)
    }
}

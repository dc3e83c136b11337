mod coordinator;
mod receiver;

pub use coordinator::{CoordinatorSettings, PersistDecision, ReplicationCoordinator};
pub use receiver::{Origin, Outcome, receive};

use crate::awareness::AwarenessError;
use crate::codec::CodecError;
use crate::document::DocumentError;
use crate::pubsub::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Failed to subscribe to {document}: {source}")]
    Subscribe {
        document: String,
        #[source]
        source: TransportError,
    },
    #[error("Replication already started")]
    AlreadyStarted,
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Awareness error: {0}")]
    Awareness(#[from] AwarenessError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

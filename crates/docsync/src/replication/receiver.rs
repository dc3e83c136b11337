//! Applies one decoded message to a document
//!
//! Shared by the replication channel and local client connections. Local
//! fan-out happens here; anything that must go back to the sender or out to
//! peers is returned in the [`Outcome`].

use super::ReplicationError;
use crate::awareness::{AwarenessChanges, AwarenessUpdate};
use crate::codec::{Envelope, Message, SyncFrame};
use crate::document::{ConnectionId, Document};
use tracing::{debug, trace};

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Another instance, via the replication channel
    Peer,
    /// A local client connection
    Client(ConnectionId),
}

impl Origin {
    fn connection(self) -> Option<ConnectionId> {
        match self {
            Origin::Peer => None,
            Origin::Client(id) => Some(id),
        }
    }
}

#[derive(Debug, Default)]
pub struct Outcome {
    /// Protocol replies for the sender
    pub replies: Vec<Message>,
    /// The CRDT state gained new information
    pub changed: bool,
    pub awareness: AwarenessChanges,
    /// Awareness update as sent, so callers can track which ids a client owns
    pub awareness_update: Option<AwarenessUpdate>,
    /// Stateless payload a client asked to broadcast to every instance
    pub broadcast_stateless: Option<String>,
}

pub fn receive(
    document: &mut Document,
    message: Message,
    origin: Origin,
) -> Result<Outcome, ReplicationError> {
    let mut outcome = Outcome::default();
    let name = document.name().to_string();

    match message {
        Message::Sync(frame) => sync(document, frame, origin, true, &mut outcome)?,
        Message::SyncReply(frame) => sync(document, frame, origin, false, &mut outcome)?,
        Message::Awareness(data) => {
            let update = AwarenessUpdate::decode(&data)?;
            let changes = document.awareness_mut().apply_update(&update);
            if !changes.is_empty() {
                let forward = document
                    .awareness()
                    .encode_update(&changes.changed_clients())
                    .encode();
                document.broadcast(
                    origin.connection(),
                    &Envelope::new(name.as_str(), Message::Awareness(forward)),
                );
            }
            outcome.awareness = changes;
            outcome.awareness_update = Some(update);
        }
        Message::QueryAwareness => {
            if !document.awareness().is_empty() {
                let update = document.awareness().full_update().encode();
                outcome.replies.push(Message::Awareness(update));
            }
        }
        Message::BroadcastStateless(payload) => {
            document.broadcast(
                origin.connection(),
                &Envelope::new(name.as_str(), Message::Stateless(payload.clone())),
            );
            if let Origin::Client(_) = origin {
                outcome.broadcast_stateless = Some(payload);
            }
        }
        Message::Stateless(payload) => {
            debug!(
                "Stateless message on {} from {:?} ({} bytes)",
                name,
                origin,
                payload.len()
            );
        }
    }

    Ok(outcome)
}

/// `request_first_sync` is false for sync replies, which ends the handshake
fn sync(
    document: &mut Document,
    frame: SyncFrame,
    origin: Origin,
    request_first_sync: bool,
    outcome: &mut Outcome,
) -> Result<(), ReplicationError> {
    match frame {
        SyncFrame::Step1(state_vector) => {
            let diff = document.encode_diff(&state_vector)?;
            outcome.replies.push(Message::Sync(SyncFrame::Step2(diff)));

            if request_first_sync {
                outcome
                    .replies
                    .push(Message::SyncReply(SyncFrame::Step1(document.state_vector())));
            }
        }
        SyncFrame::Step2(update) | SyncFrame::Update(update) => {
            outcome.changed = document.apply_update(&update)?;
            if outcome.changed {
                let name = document.name().to_string();
                document.broadcast(
                    origin.connection(),
                    &Envelope::new(name, Message::Sync(SyncFrame::Update(update))),
                );
            } else {
                trace!("Update for {} carried nothing new", document.name());
            }
        }
    }
    Ok(())
}

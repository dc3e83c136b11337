//! Envelope codec for frames on the replication channel and the client stream.
//!
//! Every frame starts with the document name, followed by a type-tagged
//! payload, all in lib0 variable-length encoding:
//!
//! ```text
//! varString(document) varUint(type) payload
//! ```
//!
//! | type | frame               | payload                                   |
//! |------|---------------------|-------------------------------------------|
//! | 0    | sync                | varUint(step) varUint8Array(data)         |
//! | 1    | awareness update    | varUint8Array(awareness update)           |
//! | 3    | awareness query     | -                                         |
//! | 4    | sync reply          | same as sync                              |
//! | 5    | stateless           | varString(payload)                        |
//! | 6    | broadcast stateless | varString(payload)                        |

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;

pub const MSG_SYNC: u32 = 0;
pub const MSG_AWARENESS: u32 = 1;
pub const MSG_QUERY_AWARENESS: u32 = 3;
pub const MSG_SYNC_REPLY: u32 = 4;
pub const MSG_STATELESS: u32 = 5;
pub const MSG_BROADCAST_STATELESS: u32 = 6;

pub const SYNC_STEP_1: u32 = 0;
pub const SYNC_STEP_2: u32 = 1;
pub const SYNC_UPDATE: u32 = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] read::Error),
    #[error("Unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("Unknown sync step {0}")]
    UnknownSyncStep(u32),
}

/// One step of the document sync protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// Sender's encoded state vector
    Step1(Vec<u8>),
    /// Update containing what the receiver of a step 1 was missing
    Step2(Vec<u8>),
    Update(Vec<u8>),
}

impl SyncFrame {
    fn write(&self, buf: &mut Vec<u8>) {
        let (step, data) = match self {
            SyncFrame::Step1(data) => (SYNC_STEP_1, data),
            SyncFrame::Step2(data) => (SYNC_STEP_2, data),
            SyncFrame::Update(data) => (SYNC_UPDATE, data),
        };
        buf.write_var(step);
        buf.write_buf(data);
    }

    fn read(cursor: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let step: u32 = cursor.read_var()?;
        let data = cursor.read_buf()?.to_vec();
        match step {
            SYNC_STEP_1 => Ok(SyncFrame::Step1(data)),
            SYNC_STEP_2 => Ok(SyncFrame::Step2(data)),
            SYNC_UPDATE => Ok(SyncFrame::Update(data)),
            other => Err(CodecError::UnknownSyncStep(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncFrame),
    SyncReply(SyncFrame),
    /// Encoded awareness update
    Awareness(Vec<u8>),
    QueryAwareness,
    Stateless(String),
    BroadcastStateless(String),
}

impl Message {
    pub fn message_type(&self) -> u32 {
        match self {
            Message::Sync(_) => MSG_SYNC,
            Message::SyncReply(_) => MSG_SYNC_REPLY,
            Message::Awareness(_) => MSG_AWARENESS,
            Message::QueryAwareness => MSG_QUERY_AWARENESS,
            Message::Stateless(_) => MSG_STATELESS,
            Message::BroadcastStateless(_) => MSG_BROADCAST_STATELESS,
        }
    }
}

/// A document-name-prefixed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub document_name: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(document_name: impl Into<String>, message: Message) -> Self {
        Self {
            document_name: document_name.into(),
            message,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_string(&self.document_name);
        buf.write_var(self.message.message_type());
        match &self.message {
            Message::Sync(frame) | Message::SyncReply(frame) => frame.write(&mut buf),
            Message::Awareness(update) => buf.write_buf(update),
            Message::QueryAwareness => {}
            Message::Stateless(payload) | Message::BroadcastStateless(payload) => {
                buf.write_string(payload)
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        let document_name = cursor.read_string()?.to_string();
        let message_type: u32 = cursor.read_var()?;

        let message = match message_type {
            MSG_SYNC => Message::Sync(SyncFrame::read(&mut cursor)?),
            MSG_SYNC_REPLY => Message::SyncReply(SyncFrame::read(&mut cursor)?),
            MSG_AWARENESS => Message::Awareness(cursor.read_buf()?.to_vec()),
            MSG_QUERY_AWARENESS => Message::QueryAwareness,
            MSG_STATELESS => Message::Stateless(cursor.read_string()?.to_string()),
            MSG_BROADCAST_STATELESS => {
                Message::BroadcastStateless(cursor.read_string()?.to_string())
            }
            other => return Err(CodecError::UnknownMessageType(other)),
        };

        Ok(Envelope {
            document_name,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_name_and_payload() {
        let frames = vec![
            Message::Sync(SyncFrame::Step1(vec![1, 2, 3])),
            Message::SyncReply(SyncFrame::Step2(vec![])),
            Message::Awareness(vec![9; 300]),
            Message::QueryAwareness,
            Message::BroadcastStateless("{\"ping\":true}".to_string()),
        ];

        for message in frames {
            let envelope = Envelope::new("notes/ünïcode", message);
            let decoded = Envelope::decode(&envelope.encode()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_layout_matches_lib0() {
        let envelope = Envelope::new("ab", Message::Sync(SyncFrame::Update(vec![7, 8])));
        assert_eq!(
            envelope.encode(),
            vec![2, b'a', b'b', MSG_SYNC as u8, SYNC_UPDATE as u8, 2, 7, 8]
        );

        let query = Envelope::new("ab", Message::QueryAwareness);
        assert_eq!(query.encode(), vec![2, b'a', b'b', MSG_QUERY_AWARENESS as u8]);
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        assert!(matches!(
            Envelope::decode(&[1, b'x', 2]),
            Err(CodecError::UnknownMessageType(2))
        ));
        assert!(matches!(
            Envelope::decode(&[1, b'x', 0, 7, 0]),
            Err(CodecError::UnknownSyncStep(7))
        ));
    }

    #[test]
    fn test_truncated_frames_are_malformed() {
        let bytes = Envelope::new("doc", Message::Awareness(vec![1, 2, 3, 4])).encode();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 2]),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(Envelope::decode(&[]), Err(CodecError::Malformed(_))));
    }
}

//! Binary protocol for live record synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ doc_id   │ sequence │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes │ varint   │ variable │
//! └──────────┴────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `sequence` depends on the message type: the last known sequence for
//! `Subscribe`, the head for `Subscribed` and `Reject`, the committed
//! sequence for `Operation` and `Ack`, and the base sequence for `Submit`.
//!
//! Handshake:
//! ```text
//! client                         server
//!   │── Subscribe(last_known) ──►│
//!   │◄── Subscribed(head) ───────│
//!   │◄── Operation(last_known+1) │  catch-up, then live
//!   │◄── Operation(…)            │
//!   │── Submit(base) ───────────►│
//!   │◄── Ack(seq) / Reject ──────│
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::change_log::ChangeLogError;
use crate::gateway::SubmitError;
use crate::model::{Change, DocumentId, Operation, SessionId};
use crate::presence::PresenceUpdate;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Start or resume a live session after `sequence`
    Subscribe = 1,
    /// Subscription accepted; `sequence` is the head at that moment
    Subscribed = 2,
    /// A committed operation
    Operation = 3,
    /// Proposed change built at base `sequence`
    Submit = 4,
    /// Submit committed
    Ack = 5,
    /// Submit or subscribe refused
    Reject = 6,
    /// Ephemeral presence update
    Presence = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Payload of a `Submit` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitBody {
    pub client_sequence: u64,
    pub change: Change,
}

/// Why a submit or subscribe was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    SchemaViolation,
    Unresolvable,
    InvalidBase,
    UnknownRecord,
    RecordExists,
    UnknownDocument,
    AheadOfHead,
    Malformed,
    Internal,
}

impl From<&SubmitError> for RejectCode {
    fn from(err: &SubmitError) -> Self {
        match err {
            SubmitError::SchemaViolation(_) => RejectCode::SchemaViolation,
            SubmitError::Unresolvable(_) => RejectCode::Unresolvable,
            SubmitError::InvalidBase { .. } => RejectCode::InvalidBase,
            SubmitError::UnknownRecord(_) => RejectCode::UnknownRecord,
            SubmitError::RecordExists(_) => RejectCode::RecordExists,
            SubmitError::Log(ChangeLogError::UnknownDocument(_)) => RejectCode::UnknownDocument,
            SubmitError::Log(_) => RejectCode::Internal,
        }
    }
}

/// Payload of a `Reject` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectBody {
    /// Client sequence of the refused submit; 0 for a refused subscribe
    pub client_sequence: u64,
    pub code: RejectCode,
    pub message: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: SessionId,
    pub doc_id: DocumentId,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, session_id: SessionId, doc_id: DocumentId, sequence: u64) -> Self {
        Self {
            msg_type,
            session_id,
            doc_id,
            sequence,
            payload: Vec::new(),
        }
    }

    fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self, ProtocolError> {
        self.payload = bincode::serde::encode_to_vec(body, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(self)
    }

    pub fn subscribe(session_id: SessionId, doc_id: DocumentId, last_known: u64) -> Self {
        Self::new(MessageType::Subscribe, session_id, doc_id, last_known)
    }

    pub fn subscribed(session_id: SessionId, doc_id: DocumentId, head: u64) -> Self {
        Self::new(MessageType::Subscribed, session_id, doc_id, head)
    }

    pub fn operation(session_id: SessionId, op: &Operation) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Operation, session_id, op.doc_id, op.sequence).with_body(op)
    }

    pub fn submit(
        session_id: SessionId,
        doc_id: DocumentId,
        base_sequence: u64,
        client_sequence: u64,
        change: Change,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Submit, session_id, doc_id, base_sequence).with_body(&SubmitBody {
            client_sequence,
            change,
        })
    }

    pub fn ack(session_id: SessionId, op: &Operation) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Ack, session_id, op.doc_id, op.sequence).with_body(op)
    }

    pub fn reject(
        session_id: SessionId,
        doc_id: DocumentId,
        head: u64,
        body: &RejectBody,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Reject, session_id, doc_id, head).with_body(body)
    }

    pub fn presence(
        session_id: SessionId,
        doc_id: DocumentId,
        update: &PresenceUpdate,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Presence, session_id, doc_id, 0).with_body(update)
    }

    pub fn ping(session_id: SessionId) -> Self {
        Self::new(MessageType::Ping, session_id, Uuid::nil(), 0)
    }

    pub fn pong(session_id: SessionId) -> Self {
        Self::new(MessageType::Pong, session_id, Uuid::nil(), 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn body<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                got: self.msg_type,
            });
        }
        let (body, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(body)
    }

    /// Operation carried by an `Operation` frame.
    pub fn operation_body(&self) -> Result<Operation, ProtocolError> {
        self.body(MessageType::Operation)
    }

    /// Committed operation carried by an `Ack` frame.
    pub fn ack_body(&self) -> Result<Operation, ProtocolError> {
        self.body(MessageType::Ack)
    }

    pub fn submit_body(&self) -> Result<SubmitBody, ProtocolError> {
        self.body(MessageType::Submit)
    }

    pub fn reject_body(&self) -> Result<RejectBody, ProtocolError> {
        self.body(MessageType::Reject)
    }

    pub fn presence_body(&self) -> Result<PresenceUpdate, ProtocolError> {
        self.body(MessageType::Presence)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {got:?}")]
    InvalidMessageType {
        expected: MessageType,
        got: MessageType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use crate::presence::PresenceState;

    fn sample_op() -> Operation {
        Operation {
            doc_id: Uuid::new_v4(),
            sequence: 7,
            session_id: Uuid::new_v4(),
            client_sequence: 3,
            change: Change::set_field("rec1", "name", FieldValue::text("Y")),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_operation_frame() {
        let op = sample_op();
        let msg = SyncMessage::operation(Uuid::new_v4(), &op).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Operation);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.doc_id, op.doc_id);
        assert_eq!(decoded.operation_body().unwrap(), op);
    }

    #[test]
    fn test_submit_frame() {
        let session = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let change = Change::delete("rec9");
        let msg = SyncMessage::submit(session, doc, 5, 2, change.clone()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.sequence, 5);
        assert_eq!(
            decoded.submit_body().unwrap(),
            SubmitBody { client_sequence: 2, change }
        );
    }

    #[test]
    fn test_reject_frame() {
        let body = RejectBody {
            client_sequence: 4,
            code: RejectCode::Unresolvable,
            message: "record '1' was deleted at sequence 6".into(),
        };
        let msg = SyncMessage::reject(Uuid::new_v4(), Uuid::new_v4(), 6, &body).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.reject_body().unwrap(), body);
    }

    #[test]
    fn test_presence_frame() {
        let update = PresenceUpdate {
            session_id: Uuid::new_v4(),
            user_name: "Alice".into(),
            state: PresenceState::Editing {
                record_id: "rec1".into(),
                field: Some("name".into()),
            },
        };
        let msg = SyncMessage::presence(update.session_id, Uuid::new_v4(), &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.presence_body().unwrap(), update);
    }

    #[test]
    fn test_handshake_frames_have_no_payload() {
        let session = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let sub = SyncMessage::subscribe(session, doc, 10);
        assert_eq!(sub.sequence, 10);
        assert!(sub.payload.is_empty());

        let ok = SyncMessage::subscribed(session, doc, 13);
        assert_eq!(ok.msg_type, MessageType::Subscribed);
        assert_eq!(ok.sequence, 13);
    }

    #[test]
    fn test_wrong_body_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.operation_body().unwrap_err(),
            ProtocolError::InvalidMessageType {
                expected: MessageType::Operation,
                got: MessageType::Ping,
            }
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_operation_frame_size() {
        let msg = SyncMessage::operation(Uuid::new_v4(), &sample_op()).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 160,
            "Encoded size {} too large for a single field write",
            encoded.len()
        );
    }

    #[test]
    fn test_reject_code_from_submit_error() {
        let err = SubmitError::InvalidBase { base: 9, head: 3 };
        assert_eq!(RejectCode::from(&err), RejectCode::InvalidBase);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Subscribe as u8, 1);
        assert_eq!(MessageType::Operation as u8, 3);
        assert_eq!(MessageType::Pong as u8, 9);
    }
}

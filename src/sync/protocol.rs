//! Binary WebSocket protocol for classroom synchronization.
//!
//! Every binary frame is a 5-byte header (protocol version, message type,
//! 24-bit big-endian payload length) followed by a bincode payload. Text
//! frames carrying the same messages as JSON are accepted for debugging.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::document::Snapshot;
use super::operation::{CommittedOperation, Operation};
use super::presence::{PresenceDelta, Role};
use super::session::{ShareState, SummaryReport, Subscription, ViewMode};
use super::{DocumentId, ParticipantId, SessionId, SyncError};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Session membership
    JoinSession = 0x10,
    LeaveSession = 0x11,
    SessionJoined = 0x12,
    SessionLeft = 0x13,

    // Document operations
    SubmitOperation = 0x20,
    OperationAck = 0x21,
    OperationCommitted = 0x22,
    Ack = 0x23,

    // Recovery
    SnapshotRequest = 0x30,
    Snapshot = 0x31,
    OperationsSince = 0x32,
    OperationsReplay = 0x33,

    // Presence
    Heartbeat = 0x40,
    CursorUpdate = 0x41,
    PresenceChanged = 0x42,

    // Classroom control
    SetShareState = 0x50,
    ShareStateChanged = 0x51,
    SetViewMode = 0x52,
    SelectProblem = 0x53,
    ProblemSelected = 0x54,
    ReportProgress = 0x55,

    // Lifecycle
    SessionEnding = 0x60,
    SessionEnded = 0x61,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::JoinSession),
            0x11 => Ok(MessageType::LeaveSession),
            0x12 => Ok(MessageType::SessionJoined),
            0x13 => Ok(MessageType::SessionLeft),
            0x20 => Ok(MessageType::SubmitOperation),
            0x21 => Ok(MessageType::OperationAck),
            0x22 => Ok(MessageType::OperationCommitted),
            0x23 => Ok(MessageType::Ack),
            0x30 => Ok(MessageType::SnapshotRequest),
            0x31 => Ok(MessageType::Snapshot),
            0x32 => Ok(MessageType::OperationsSince),
            0x33 => Ok(MessageType::OperationsReplay),
            0x40 => Ok(MessageType::Heartbeat),
            0x41 => Ok(MessageType::CursorUpdate),
            0x42 => Ok(MessageType::PresenceChanged),
            0x50 => Ok(MessageType::SetShareState),
            0x51 => Ok(MessageType::ShareStateChanged),
            0x52 => Ok(MessageType::SetViewMode),
            0x53 => Ok(MessageType::SelectProblem),
            0x54 => Ok(MessageType::ProblemSelected),
            0x55 => Ok(MessageType::ReportProgress),
            0x60 => Ok(MessageType::SessionEnding),
            0x61 => Ok(MessageType::SessionEnded),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Initial handshake
    Hello {
        protocol_version: u8,
        client_name: String,
        /// Token from an earlier `SessionJoined`, to re-attach after a drop
        resume_token: Option<String>,
    },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },

    /// Join a class session
    JoinSession {
        session_id: SessionId,
        participant_id: ParticipantId,
        name: String,
        role: Role,
    },

    /// Leave the current session
    LeaveSession,

    /// Submit an edit to a document
    SubmitOperation {
        document_id: DocumentId,
        operation: Operation,
    },

    /// Report the latest version applied locally
    Ack { document_id: DocumentId, version: u64 },

    /// Request the current content of a document
    SnapshotRequest { document_id: DocumentId },

    /// Request every committed operation newer than `version`
    OperationsSince { document_id: DocumentId, version: u64 },

    /// Keep presence alive
    Heartbeat,

    /// Update local cursor position
    CursorUpdate {
        document_id: DocumentId,
        offset: usize,
        selection_end: Option<usize>,
    },

    /// Teacher only
    SetShareState { state: ShareState },

    /// Teacher only
    SetViewMode { mode: ViewMode },

    /// Teacher only
    SelectProblem { problem_id: Option<String> },

    /// Latest local test run
    ReportProgress { tests_passed: u32, total_tests: u32 },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::JoinSession { .. } => MessageType::JoinSession,
            ClientMessage::LeaveSession => MessageType::LeaveSession,
            ClientMessage::SubmitOperation { .. } => MessageType::SubmitOperation,
            ClientMessage::Ack { .. } => MessageType::Ack,
            ClientMessage::SnapshotRequest { .. } => MessageType::SnapshotRequest,
            ClientMessage::OperationsSince { .. } => MessageType::OperationsSince,
            ClientMessage::Heartbeat => MessageType::Heartbeat,
            ClientMessage::CursorUpdate { .. } => MessageType::CursorUpdate,
            ClientMessage::SetShareState { .. } => MessageType::SetShareState,
            ClientMessage::SetViewMode { .. } => MessageType::SetViewMode,
            ClientMessage::SelectProblem { .. } => MessageType::SelectProblem,
            ClientMessage::ReportProgress { .. } => MessageType::ReportProgress,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake response
    Welcome {
        protocol_version: u8,
        connection_id: String,
        server_time: i64,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        document_id: Option<DocumentId>,
    },

    /// Graceful disconnect acknowledgment
    Goodbye { reason: Option<String> },

    /// Confirmation of joining a session
    SessionJoined {
        subscription: Subscription,
        participants: Vec<ParticipantInfo>,
    },

    /// Confirmation of leaving a session
    SessionLeft { session_id: SessionId },

    /// Reply to the author of a submitted operation
    OperationAck {
        document_id: DocumentId,
        client_seq: u64,
        version: u64,
        duplicate: bool,
    },

    /// An operation committed by someone else
    OperationCommitted {
        document_id: DocumentId,
        committed: CommittedOperation,
    },

    /// Full document content
    Snapshot { snapshot: Snapshot },

    /// Committed operations in version order
    OperationsReplay {
        document_id: DocumentId,
        operations: Vec<CommittedOperation>,
    },

    /// A presence change in the session
    PresenceChanged {
        session_id: SessionId,
        delta: PresenceDelta,
    },

    /// Share state changed; carries the recipient's recomputed subscriptions
    ShareStateChanged {
        session_id: SessionId,
        state: ShareState,
        documents: Vec<DocumentId>,
        writable: bool,
    },

    /// Teacher picked a problem
    ProblemSelected {
        session_id: SessionId,
        problem_id: Option<String>,
    },

    /// Session teardown has begun; flush pending edits
    SessionEnding { session_id: SessionId, grace_ms: u64 },

    /// Session is over
    SessionEnded {
        session_id: SessionId,
        report: SummaryReport,
    },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::SessionJoined { .. } => MessageType::SessionJoined,
            ServerMessage::SessionLeft { .. } => MessageType::SessionLeft,
            ServerMessage::OperationAck { .. } => MessageType::OperationAck,
            ServerMessage::OperationCommitted { .. } => MessageType::OperationCommitted,
            ServerMessage::Snapshot { .. } => MessageType::Snapshot,
            ServerMessage::OperationsReplay { .. } => MessageType::OperationsReplay,
            ServerMessage::PresenceChanged { .. } => MessageType::PresenceChanged,
            ServerMessage::ShareStateChanged { .. } => MessageType::ShareStateChanged,
            ServerMessage::ProblemSelected { .. } => MessageType::ProblemSelected,
            ServerMessage::SessionEnding { .. } => MessageType::SessionEnding,
            ServerMessage::SessionEnded { .. } => MessageType::SessionEnded,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Information about a session participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub name: String,
    pub role: Role,
    pub color: String,
    pub online: bool,
    pub joined_at: i64,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    InvalidOperation = 2,
    StaleSnapshot = 3,
    Unauthorized = 4,
    PresenceTimeout = 5,
    TransportFailure = 6,
    NotFound = 7,
    AlreadyJoined = 8,
    SessionFull = 9,
    NotJoined = 10,
    VersionMismatch = 11,
    ServerError = 12,
}

impl From<&SyncError> for ErrorCode {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            SyncError::StaleSnapshot { .. } => ErrorCode::StaleSnapshot,
            SyncError::Unauthorized(_) => ErrorCode::Unauthorized,
            SyncError::PresenceTimeout(_) => ErrorCode::PresenceTimeout,
            SyncError::TransportFailure(_) => ErrorCode::TransportFailure,
            SyncError::SessionNotFound(_)
            | SyncError::DocumentNotFound(_)
            | SyncError::ParticipantNotFound(_) => ErrorCode::NotFound,
            SyncError::AlreadyJoined(_, _) => ErrorCode::AlreadyJoined,
            SyncError::SessionFull(_) => ErrorCode::SessionFull,
            SyncError::Storage(_) | SyncError::Internal(_) => ErrorCode::ServerError,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;
        Self::frame(msg.message_type(), &payload)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;
        Self::frame(msg.message_type(), &payload)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a client message from a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a server message as JSON text
    pub fn encode_server_json(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Create an error response message
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        document_id: Option<DocumentId>,
    ) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
            document_id,
        }
    }

    /// Error response for a sync failure
    pub fn sync_error(err: &SyncError, document_id: Option<DocumentId>) -> ServerMessage {
        Self::error_response(ErrorCode::from(err), err.to_string(), document_id)
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }

    fn check_type(header: MessageType, decoded: MessageType) -> Result<(), ProtocolError> {
        if header != decoded {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header type {:?} does not match payload {:?}",
                header, decoded
            )));
        }
        Ok(())
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::operation::TextOperation;

    #[test]
    fn test_encode_decode_client_hello() {
        let msg = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: "Alice's laptop".to_string(),
            resume_token: None,
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Hello as u8);

        let decoded = SyncProtocol::decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_submit_operation_frame() {
        let msg = ClientMessage::SubmitOperation {
            document_id: "class-1/alice".to_string(),
            operation: Operation::new("alice", 3, 7, TextOperation::insert_at(4, 2, "→x").unwrap()),
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        let len = ((encoded[2] as usize) << 16) | ((encoded[3] as usize) << 8) | encoded[4] as usize;
        assert_eq!(len + 5, encoded.len());

        match SyncProtocol::decode_client(&encoded).unwrap() {
            ClientMessage::SubmitOperation { operation, .. } => {
                assert_eq!(operation.client_seq, 3);
                assert_eq!(operation.payload.target_len(), 6);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_server_error_from_sync_error() {
        let err = SyncError::StaleSnapshot {
            requested: 2,
            oldest: 40,
        };
        let msg = SyncProtocol::sync_error(&err, Some("class-1/alice".to_string()));

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        match SyncProtocol::decode_server(&encoded).unwrap() {
            ServerMessage::Error {
                code, document_id, ..
            } => {
                assert_eq!(code, ErrorCode::StaleSnapshot);
                assert_eq!(document_id.as_deref(), Some("class-1/alice"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_share_state_json_text_frame() {
        let text = r#"{"setShareState":{"state":{"studentShared":"42"}}}"#;
        let msg = SyncProtocol::decode_client_json(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetShareState {
                state: ShareState::StudentShared("42".to_string())
            }
        );

        let unit = SyncProtocol::decode_client_json(r#""heartbeat""#).unwrap();
        assert_eq!(unit, ClientMessage::Heartbeat);
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_header_type_must_match_payload() {
        let data = SyncProtocol::encode_client(&ClientMessage::Heartbeat).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::Ping as u8;
        assert!(matches!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::InvalidFormat(_))
        ));

        bytes[1] = 0xEE;
        assert!(matches!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        assert!(matches!(
            SyncProtocol::decode_client(&[PROTOCOL_VERSION, 0x40]),
            Err(ProtocolError::InvalidFormat(_))
        ));
        let data = SyncProtocol::encode_client(&ClientMessage::SnapshotRequest {
            document_id: "class-1/alice".into(),
        })
        .unwrap();
        assert!(matches!(
            SyncProtocol::decode_client(&data[..data.len() - 2]),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::Hello);
        assert_eq!(MessageType::try_from(0x22).unwrap(), MessageType::OperationCommitted);
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            ErrorCode::from(&SyncError::SessionNotFound("x".into())),
            ErrorCode::NotFound
        );
        assert_eq!(
            ErrorCode::from(&SyncError::Unauthorized("x".into())),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            ErrorCode::from(&SyncError::Storage("disk".into())),
            ErrorCode::ServerError
        );
    }
}

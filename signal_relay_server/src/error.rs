//! Error types for the signaling relay

use signal_relay_protocol::{ErrorCode, RoomId, RoomIdError, ServerEvent};
use thiserror::Error;

/// Per-operation rejections, reported to the originating connection only
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Missing or invalid room id or envelope shape
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Forwarding attempted for a room the sender never joined
    #[error("Not a member of room {0}")]
    NotInRoom(RoomId),

    /// Joining would exceed the room size cap
    #[error("Room {room} is full ({max} members)")]
    RoomFull { room: RoomId, max: usize },

    /// The connection is not (or no longer) registered
    #[error("Unknown connection")]
    UnknownConnection,
}

impl SignalingError {
    /// Wire code for this rejection, `None` if it is never reported to a client
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SignalingError::MalformedRequest(_) => Some(ErrorCode::MalformedRequest),
            SignalingError::NotInRoom(_) => Some(ErrorCode::NotInRoom),
            SignalingError::RoomFull { .. } => Some(ErrorCode::RoomFull),
            SignalingError::UnknownConnection => None,
        }
    }

    /// The `error` event sent back to the originator
    pub fn to_event(&self) -> Option<ServerEvent> {
        let room_id = match self {
            SignalingError::NotInRoom(room) | SignalingError::RoomFull { room, .. } => {
                Some(room.clone())
            }
            _ => None,
        };
        Some(ServerEvent::Error {
            code: self.code()?,
            message: self.to_string(),
            room_id,
        })
    }
}

impl From<RoomIdError> for SignalingError {
    fn from(err: RoomIdError) -> Self {
        SignalingError::MalformedRequest(err.to_string())
    }
}

/// Errors from decoding a client frame
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame type carries no request (e.g. non-UTF-8 binary)
    #[error("Unsupported message type")]
    UnsupportedType,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<ClientRequestError> for SignalingError {
    fn from(err: ClientRequestError) -> Self {
        SignalingError::MalformedRequest(err.to_string())
    }
}

/// Errors that stop the relay itself
#[derive(Error, Debug)]
pub enum ServerError {
    /// Binding or accepting on the listener failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Wire types for the WebRTC signaling relay
//!
//! Every frame is a single JSON object tagged by its `kind` field.
//!
//! ## Requests (client → relay)
//!
//! ```json
//! {"kind": "join", "roomId": "r1"}
//! {"kind": "offer", "roomId": "r1", "payload": {"sdp": "..."}}
//! {"kind": "answer", "roomId": "r1", "payload": {"sdp": "..."}}
//! {"kind": "candidate", "roomId": "r1", "payload": {"candidate": "..."}}
//! ```
//!
//! ## Events (relay → client)
//!
//! ```json
//! {"kind": "offer", "roomId": "r1", "from": "<uuid>", "payload": {"sdp": "..."}}
//! {"kind": "peer-left", "roomId": "r1", "peer": "<uuid>"}
//! {"kind": "error", "code": "not-in-room", "message": "...", "roomId": "r1"}
//! ```
//!
//! Payloads are never inspected; the exact JSON text a client sent is what its
//! peers receive.

#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, value::RawValue};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Default upper bound on the byte length of a room identifier
pub const DEFAULT_MAX_ROOM_ID_LEN: usize = 128;

/// Process-unique identifier assigned to a connection when it is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reasons a client-supplied room identifier is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("room id must not be empty")]
    Empty,

    #[error("room id is {len} bytes, the limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Room identifier
///
/// Opaque to the relay beyond the length bounds enforced by [`RoomId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Validate a raw room identifier against `max_len` bytes
    pub fn parse(raw: impl Into<String>, max_len: usize) -> Result<Self, RoomIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.len() > max_len {
            return Err(RoomIdError::TooLong {
                len: raw.len(),
                max: max_len,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handshake payload, kept as the raw JSON text it arrived as
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    pub fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    /// Wrap JSON text without re-encoding it
    pub fn from_json(json: impl Into<String>) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.into()).map(Self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::value::to_raw_value(value).map(Self)
    }

    pub fn get(&self) -> &str {
        self.0.get()
    }

    pub fn is_null(&self) -> bool {
        self.get() == "null"
    }

    /// Decode the payload; lossy for numbers outside `f64`/`u64`/`i64` range
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(self.get())
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for Payload {}

/// The three handshake envelopes the relay forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind tag of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Join,
    Offer,
    Answer,
    Candidate,
}

impl RequestKind {
    /// The envelope kind to forward, or `None` for `join`
    pub fn signal(self) -> Option<SignalKind> {
        match self {
            RequestKind::Join => None,
            RequestKind::Offer => Some(SignalKind::Offer),
            RequestKind::Answer => Some(SignalKind::Answer),
            RequestKind::Candidate => Some(SignalKind::Candidate),
        }
    }
}

impl From<SignalKind> for RequestKind {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Offer => RequestKind::Offer,
            SignalKind::Answer => RequestKind::Answer,
            SignalKind::Candidate => RequestKind::Candidate,
        }
    }
}

/// A request sent by a client
///
/// `room_id` is kept as the raw string; the relay validates it into a [`RoomId`]
/// with its configured limits. A missing `payload` decodes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub kind: RequestKind,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Payload::is_null")]
    pub payload: Payload,
}

impl ClientRequest {
    pub fn join(room_id: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Join,
            room_id: room_id.into(),
            payload: Payload::null(),
        }
    }

    pub fn signal(kind: SignalKind, room_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            kind: kind.into(),
            room_id: room_id.into(),
            payload,
        }
    }
}

impl FromStr for ClientRequest {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Machine-readable reason attached to an `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedRequest,
    NotInRoom,
    RoomFull,
}

/// An event delivered by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerEvent {
    Offer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        from: ConnectionId,
        payload: Payload,
    },
    Answer {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        from: ConnectionId,
        payload: Payload,
    },
    Candidate {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        from: ConnectionId,
        payload: Payload,
    },
    /// A member of `room_id` disconnected
    PeerLeft {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        peer: ConnectionId,
    },
    /// A request from this connection was rejected
    Error {
        code: ErrorCode,
        message: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
}

impl ServerEvent {
    /// Build the forwarded form of a handshake envelope
    pub fn signal(kind: SignalKind, room_id: RoomId, from: ConnectionId, payload: Payload) -> Self {
        match kind {
            SignalKind::Offer => ServerEvent::Offer {
                room_id,
                from,
                payload,
            },
            SignalKind::Answer => ServerEvent::Answer {
                room_id,
                from,
                payload,
            },
            SignalKind::Candidate => ServerEvent::Candidate {
                room_id,
                from,
                payload,
            },
        }
    }

    /// Envelope kind, if this is a forwarded handshake message
    pub fn signal_kind(&self) -> Option<SignalKind> {
        match self {
            ServerEvent::Offer { .. } => Some(SignalKind::Offer),
            ServerEvent::Answer { .. } => Some(SignalKind::Answer),
            ServerEvent::Candidate { .. } => Some(SignalKind::Candidate),
            ServerEvent::PeerLeft { .. } | ServerEvent::Error { .. } => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
enum EventKind {
    Offer,
    Answer,
    Candidate,
    PeerLeft,
    Error,
}

/// Flat decoding shape for [`ServerEvent`]
///
/// Tagged enums buffer their fields before dispatching on the tag, which
/// `RawValue` cannot survive, so events are read into this struct first.
#[derive(Deserialize)]
struct WireEvent {
    kind: EventKind,
    #[serde(rename = "roomId")]
    room_id: Option<RoomId>,
    from: Option<ConnectionId>,
    #[serde(default)]
    payload: Payload,
    peer: Option<ConnectionId>,
    code: Option<ErrorCode>,
    message: Option<String>,
}

/// A field required by the event's `kind` was absent
#[derive(Debug, Error)]
#[error("missing field `{0}`")]
pub struct MissingField(&'static str);

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, MissingField> {
    value.ok_or(MissingField(field))
}

impl TryFrom<WireEvent> for ServerEvent {
    type Error = MissingField;

    fn try_from(wire: WireEvent) -> Result<Self, MissingField> {
        let signal = match wire.kind {
            EventKind::Offer => SignalKind::Offer,
            EventKind::Answer => SignalKind::Answer,
            EventKind::Candidate => SignalKind::Candidate,
            EventKind::PeerLeft => {
                return Ok(ServerEvent::PeerLeft {
                    room_id: required(wire.room_id, "roomId")?,
                    peer: required(wire.peer, "peer")?,
                });
            }
            EventKind::Error => {
                return Ok(ServerEvent::Error {
                    code: required(wire.code, "code")?,
                    message: wire.message.unwrap_or_default(),
                    room_id: wire.room_id,
                });
            }
        };
        Ok(ServerEvent::signal(
            signal,
            required(wire.room_id, "roomId")?,
            required(wire.from, "from")?,
            wire.payload,
        ))
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEvent::deserialize(deserializer)?;
        ServerEvent::try_from(wire).map_err(serde::de::Error::custom)
    }
}

impl FromStr for ServerEvent {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

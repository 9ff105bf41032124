//! WebSocket signaling relay for WebRTC peers
//!
//! Clients connect over WebSocket, join a named room and exchange the
//! `offer`, `answer` and `candidate` envelopes needed to set up a direct
//! peer-to-peer connection. The relay forwards each envelope to every other
//! member of the room without looking at its payload.
//!
//! # Protocol
//!
//! Client → relay, one JSON object per frame:
//! - `{"kind": "join", "roomId": "r1"}`
//! - `{"kind": "offer" | "answer" | "candidate", "roomId": "r1", "payload": ...}`
//!
//! Relay → client:
//! - `{"kind": "offer" | "answer" | "candidate", "roomId": "r1", "from": "<uuid>", "payload": ...}`
//! - `{"kind": "peer-left", "roomId": "r1", "peer": "<uuid>"}`
//! - `{"kind": "error", "code": "malformed-request" | "not-in-room" | "room-full", "message": "..."}`
//!
//! Joins are not acknowledged. Envelopes are not queued for peers that join later.
//!
//! # Example
//!
//! ```bash
//! signal-relay --port 3000
//! websocat ws://127.0.0.1:3000
//! {"kind":"join","roomId":"r1"}
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;

pub use config::RelayConfig;
pub use error::{ClientRequestError, ServerError, SignalingError};
pub use server::RelayServer;
pub use state::{Delivery, JoinOutcome, ServerState, SessionState};

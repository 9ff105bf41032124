//! Connection and room registry for the signaling relay
//!
//! All membership changes go through one mutex. Fan-out snapshots the
//! recipients under the lock and delivers after releasing it, so a join or
//! disconnect racing with a broadcast never invalidates the iteration.

use crate::{config::RelayConfig, error::SignalingError};
use signal_relay_protocol::{ConnectionId, Payload, RoomId, ServerEvent, SignalKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Outbound queue of a connection
pub type Outbox = mpsc::Sender<ServerEvent>;

/// Lifecycle state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not a member of any room yet
    Unjoined,
    /// Member of at least one room
    Joined(BTreeSet<RoomId>),
    /// Closed, or never registered
    Disconnected,
}

/// Result of a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

/// Per-broadcast delivery report
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Recipients whose queue was full or closed
    pub skipped: usize,
}

struct Session {
    outbox: Outbox,
    rooms: BTreeSet<RoomId>,
}

#[derive(Default)]
struct InnerState {
    connections: HashMap<ConnectionId, Session>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl InnerState {
    /// Outboxes of every member of `room` except `exclude`
    fn recipients(&self, room: &RoomId, exclude: ConnectionId) -> Vec<(ConnectionId, Outbox)> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| **id != exclude)
            .filter_map(|id| {
                self.connections
                    .get(id)
                    .map(|session| (*id, session.outbox.clone()))
            })
            .collect()
    }
}

/// Shared registry handle; clones refer to the same state
#[derive(Clone, Default)]
pub struct ServerState {
    inner: Arc<Mutex<InnerState>>,
    config: RelayConfig,
}

impl ServerState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::default(),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, InnerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly accepted connection
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::new();
        self.lock().connections.insert(
            id,
            Session {
                outbox,
                rooms: BTreeSet::new(),
            },
        );
        debug!(%id, "connection registered");
        id
    }

    /// Add `id` to `room_id`, creating the room if it has no members yet
    pub fn join(&self, id: ConnectionId, room_id: &str) -> Result<JoinOutcome, SignalingError> {
        let room = RoomId::parse(room_id, self.config.max_room_id_len)?;
        let mut state = self.lock();
        let state = &mut *state;

        let session = state
            .connections
            .get_mut(&id)
            .ok_or(SignalingError::UnknownConnection)?;
        let members = state.rooms.get(&room).map_or(0, HashSet::len);

        if session.rooms.contains(&room) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if !self.config.room_has_space(members) {
            debug!(%id, %room, members, "join rejected, room full");
            return Err(SignalingError::RoomFull {
                room,
                max: self.config.max_room_size,
            });
        }

        session.rooms.insert(room.clone());
        state.rooms.entry(room.clone()).or_default().insert(id);
        debug!(%id, %room, members = members + 1, "joined room");
        Ok(JoinOutcome::Joined)
    }

    /// Forward a handshake envelope to every other member of `room_id`
    pub fn forward(
        &self,
        id: ConnectionId,
        kind: SignalKind,
        room_id: &str,
        payload: Payload,
    ) -> Result<Delivery, SignalingError> {
        let room = RoomId::parse(room_id, self.config.max_room_id_len)?;
        let recipients = {
            let state = self.lock();
            let session = state
                .connections
                .get(&id)
                .ok_or(SignalingError::UnknownConnection)?;
            if !session.rooms.contains(&room) {
                return Err(SignalingError::NotInRoom(room));
            }
            state.recipients(&room, id)
        };

        let event = ServerEvent::signal(kind, room.clone(), id, payload);
        let delivery = deliver(recipients, &event);
        debug!(
            from = %id,
            %room,
            %kind,
            delivered = delivery.delivered,
            skipped = delivery.skipped,
            "forwarded envelope"
        );
        Ok(delivery)
    }

    /// Remove `id` from every room and notify the remaining members
    ///
    /// Idempotent; returns the rooms the connection was removed from.
    pub fn disconnect(&self, id: ConnectionId) -> Vec<RoomId> {
        let mut notifications = Vec::new();
        let left = {
            let mut state = self.lock();
            let Some(session) = state.connections.remove(&id) else {
                return Vec::new();
            };
            for room in &session.rooms {
                let now_empty = match state.rooms.get_mut(room) {
                    Some(members) => {
                        members.remove(&id);
                        members.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    state.rooms.remove(room);
                    debug!(%room, "room removed");
                } else {
                    notifications.push((room.clone(), state.recipients(room, id)));
                }
            }
            session.rooms.into_iter().collect::<Vec<_>>()
        };

        for (room_id, recipients) in notifications {
            deliver(recipients, &ServerEvent::PeerLeft { room_id, peer: id });
        }
        debug!(%id, rooms = left.len(), "connection released");
        left
    }

    pub fn session_state(&self, id: ConnectionId) -> SessionState {
        match self.lock().connections.get(&id) {
            None => SessionState::Disconnected,
            Some(session) if session.rooms.is_empty() => SessionState::Unjoined,
            Some(session) => SessionState::Joined(session.rooms.clone()),
        }
    }

    /// Members of a room, sorted
    pub fn room_members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let mut members: Vec<_> = self
            .lock()
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

/// Best-effort fan-out; a failing recipient never stops the others
fn deliver(recipients: Vec<(ConnectionId, Outbox)>, event: &ServerEvent) -> Delivery {
    let mut delivery = Delivery::default();
    for (peer, outbox) in recipients {
        match outbox.try_send(event.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(%peer, "outbound queue full, dropping event");
                delivery.skipped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%peer, "outbound queue closed, skipping peer");
                delivery.skipped += 1;
            }
        }
    }
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use signal_relay_protocol::{ClientRequest, ErrorCode};
    use tokio::sync::mpsc::Receiver;

    fn connect(state: &ServerState) -> (ConnectionId, Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (state.connect(tx), rx)
    }

    fn payload(value: Value) -> Payload {
        Payload::from_value(&value).unwrap()
    }

    fn room(name: &str) -> RoomId {
        RoomId::parse(name, 64).unwrap()
    }

    fn mesh() -> ServerState {
        ServerState::new(RelayConfig {
            max_room_size: 0,
            ..RelayConfig::default()
        })
    }

    #[test]
    fn session_lifecycle() {
        let state = ServerState::default();
        let (a, _rx) = connect(&state);
        assert_eq!(state.session_state(a), SessionState::Unjoined);

        state.join(a, "r1").unwrap();
        assert_eq!(
            state.session_state(a),
            SessionState::Joined(BTreeSet::from([room("r1")]))
        );

        assert_eq!(state.disconnect(a), vec![room("r1")]);
        assert_eq!(state.session_state(a), SessionState::Disconnected);
    }

    #[test]
    fn forwards_to_other_members_only() {
        let state = ServerState::default();
        let (a, mut rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        let delivery = state
            .forward(a, SignalKind::Offer, "r1", payload(json!({"sdp": "x"})))
            .unwrap();
        assert_eq!(delivery, Delivery { delivered: 1, skipped: 0 });

        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerEvent::Offer {
                room_id: room("r1"),
                from: a,
                payload: payload(json!({"sdp": "x"})),
            }
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn other_rooms_receive_nothing() {
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r2").unwrap();

        let delivery = state
            .forward(a, SignalKind::Candidate, "r1", payload(json!({"candidate": "c"})))
            .unwrap();
        assert_eq!(delivery.delivered, 0);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn join_is_idempotent() {
        let state = ServerState::default();
        let (a, _rx) = connect(&state);
        assert_eq!(state.join(a, "r1").unwrap(), JoinOutcome::Joined);
        assert_eq!(state.join(a, "r1").unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(state.room_members(&room("r1")), vec![a]);
    }

    #[test]
    fn rejoin_of_full_room_is_still_idempotent() {
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, _rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();
        assert_eq!(state.join(b, "r1").unwrap(), JoinOutcome::AlreadyMember);
    }

    #[test]
    fn room_size_is_capped() {
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, _rx_b) = connect(&state);
        let (c, _rx_c) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        let err = state.join(c, "r1").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RoomFull));
        assert_eq!(state.room_members(&room("r1")).len(), 2);
        assert_eq!(state.session_state(c), SessionState::Unjoined);
    }

    #[test]
    fn mesh_rooms_broadcast_minus_sender() {
        let state = mesh();
        let (a, mut rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        let (c, mut rx_c) = connect(&state);
        for id in [a, b, c] {
            state.join(id, "r1").unwrap();
        }

        let delivery = state.forward(b, SignalKind::Answer, "r1", payload(json!(1))).unwrap();
        assert_eq!(delivery.delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap().signal_kind(), Some(SignalKind::Answer));
        assert_eq!(rx_c.try_recv().unwrap().signal_kind(), Some(SignalKind::Answer));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn forwarding_requires_membership() {
        let state = ServerState::default();
        let (a, mut rx_a) = connect(&state);
        let (c, _rx_c) = connect(&state);
        state.join(a, "r1").unwrap();

        let err = state
            .forward(c, SignalKind::Offer, "r1", payload(json!({})))
            .unwrap_err();
        assert_eq!(err, SignalingError::NotInRoom(room("r1")));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn invalid_room_ids_are_malformed() {
        let state = ServerState::new(RelayConfig {
            max_room_id_len: 4,
            ..RelayConfig::default()
        });
        let (a, _rx) = connect(&state);
        assert!(matches!(
            state.join(a, ""),
            Err(SignalingError::MalformedRequest(_))
        ));
        assert!(matches!(
            state.join(a, "toolong"),
            Err(SignalingError::MalformedRequest(_))
        ));
        assert!(matches!(
            state.forward(a, SignalKind::Offer, "", Payload::null()),
            Err(SignalingError::MalformedRequest(_))
        ));
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn disconnect_notifies_and_removes_empty_rooms() {
        let state = ServerState::default();
        let (a, mut rx_a) = connect(&state);
        let (b, _rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        state.disconnect(b);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerEvent::PeerLeft {
                room_id: room("r1"),
                peer: b,
            }
        );
        assert_eq!(state.room_members(&room("r1")), vec![a]);

        let delivery = state.forward(a, SignalKind::Answer, "r1", payload(json!({}))).unwrap();
        assert_eq!(delivery, Delivery::default());

        state.disconnect(a);
        assert_eq!(state.room_count(), 0);
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let state = ServerState::default();
        let (a, _rx) = connect(&state);
        assert!(state.disconnect(a).is_empty());
        assert!(state.disconnect(a).is_empty());
        assert!(state.disconnect(ConnectionId::new()).is_empty());
    }

    #[test]
    fn multiple_rooms_per_connection() {
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(a, "r2").unwrap();
        state.join(b, "r2").unwrap();

        state.disconnect(a);
        assert_eq!(state.room_count(), 1);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::PeerLeft { peer, .. } if peer == a
        ));
    }

    #[test]
    fn failing_recipient_does_not_abort_broadcast() {
        let state = mesh();
        let (a, _rx_a) = connect(&state);
        let (b, rx_b) = connect(&state);
        let (c, mut rx_c) = connect(&state);
        for id in [a, b, c] {
            state.join(id, "r1").unwrap();
        }
        drop(rx_b);

        let delivery = state.forward(a, SignalKind::Offer, "r1", payload(json!("sdp"))).unwrap();
        assert_eq!(delivery, Delivery { delivered: 1, skipped: 1 });
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn full_queue_is_skipped() {
        let state = ServerState::default();
        let (tx, _rx_a) = mpsc::channel(1);
        let a = state.connect(tx);
        let (b, _rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        let first = state.forward(b, SignalKind::Candidate, "r1", payload(json!(1))).unwrap();
        let second = state.forward(b, SignalKind::Candidate, "r1", payload(json!(2))).unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(second, Delivery { delivered: 0, skipped: 1 });
    }

    #[test]
    fn payload_bytes_are_forwarded_verbatim() {
        let exact = r#"{"z":1,"big":123456789012345678901234567890,"f":0.10000000000000000555}"#;
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        let text = format!(r#"{{"kind":"offer","roomId":"r1","payload":{exact}}}"#);
        let request: ClientRequest = text.parse().unwrap();
        state
            .forward(a, SignalKind::Offer, &request.room_id, request.payload)
            .unwrap();

        let forwarded = rx_b.try_recv().unwrap().to_string();
        assert!(
            forwarded.contains(&format!(r#""payload":{exact}"#)),
            "payload altered in {forwarded}"
        );
    }

    #[test]
    fn single_sender_order_is_preserved() {
        let state = ServerState::default();
        let (a, _rx_a) = connect(&state);
        let (b, mut rx_b) = connect(&state);
        state.join(a, "r1").unwrap();
        state.join(b, "r1").unwrap();

        for n in 0..5 {
            state.forward(a, SignalKind::Candidate, "r1", payload(json!(n))).unwrap();
        }
        for n in 0..5 {
            match rx_b.try_recv().unwrap() {
                ServerEvent::Candidate { payload, .. } => assert_eq!(payload.get(), n.to_string()),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}

//! Relay limits

use signal_relay_protocol::DEFAULT_MAX_ROOM_ID_LEN;
use std::time::Duration;

/// Default room size: one caller and one callee
pub const DEFAULT_MAX_ROOM_SIZE: usize = 2;

/// Default per-connection outbound queue capacity
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default time allowed for a client to complete the WebSocket upgrade
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Limits applied by [`ServerState`](crate::ServerState)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum members per room; `0` disables the cap (full mesh)
    pub max_room_size: usize,
    /// Maximum room id length in bytes
    pub max_room_id_len: usize,
    /// Events buffered per connection before further deliveries to it are dropped
    pub outbound_queue: usize,
    /// Sockets that have not finished the WebSocket upgrade by then are dropped
    pub handshake_timeout: Duration,
}

impl RelayConfig {
    pub(crate) fn room_has_space(&self, members: usize) -> bool {
        self.max_room_size == 0 || members < self.max_room_size
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.outbound_queue.max(1)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_room_size: DEFAULT_MAX_ROOM_SIZE,
            max_room_id_len: DEFAULT_MAX_ROOM_ID_LEN,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

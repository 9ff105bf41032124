//! WebSocket connection handling for the signaling relay
//!
//! One task per connection reads frames and applies them to the shared
//! [`ServerState`]; a companion writer task drains the connection's outbound
//! queue into the socket.

use crate::error::{ClientRequestError, SignalingError};
use crate::state::ServerState;
use futures::{SinkExt, StreamExt};
use signal_relay_protocol::{ClientRequest, ConnectionId, ServerEvent};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};

/// Decode one inbound frame
///
/// Returns `Ok(None)` for control frames that carry no request.
pub fn parse_request(
    message: Result<Message, tungstenite::Error>,
) -> Result<Option<ClientRequest>, ClientRequestError> {
    let text = match message? {
        Message::Text(text) => text.as_str().to_owned(),
        Message::Binary(data) => std::str::from_utf8(&data)
            .map_err(|_| ClientRequestError::UnsupportedType)?
            .to_owned(),
        Message::Close(_) => return Err(ClientRequestError::Close),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(None),
    };
    Ok(Some(text.parse()?))
}

/// Apply a decoded request on behalf of `sender`
pub fn dispatch(
    state: &ServerState,
    sender: ConnectionId,
    request: ClientRequest,
) -> Result<(), SignalingError> {
    match request.kind.signal() {
        None => {
            state.join(sender, &request.room_id)?;
        }
        Some(kind) => {
            state.forward(sender, kind, &request.room_id, request.payload)?;
        }
    }
    Ok(())
}

/// Perform the WebSocket handshake and serve the connection until it closes
///
/// Sockets that do not complete the upgrade within the configured handshake
/// timeout are dropped.
pub async fn handle_connection<S>(stream: S, peer_addr: SocketAddr, state: ServerState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let timeout = state.config().handshake_timeout;
    match tokio::time::timeout(timeout, accept_async(stream)).await {
        Ok(Ok(socket)) => serve_socket(socket, peer_addr, state).await,
        Ok(Err(err)) => warn!(%peer_addr, "WebSocket handshake failed: {err}"),
        Err(_) => debug!(%peer_addr, ?timeout, "WebSocket handshake timed out"),
    }
}

async fn serve_socket<S>(socket: WebSocketStream<S>, peer_addr: SocketAddr, state: ServerState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config().queue_capacity());
    let id = state.connect(tx.clone());
    info!(%id, %peer_addr, "connection accepted");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%id, "failed to encode event: {err}");
                    continue;
                }
            };
            if let Err(err) = ws_sender.send(Message::text(text)).await {
                debug!(%id, "write failed: {err}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(message) = ws_receiver.next().await {
        match parse_request(message) {
            Ok(Some(request)) => {
                if let Err(err) = dispatch(&state, id, request) {
                    reject(&tx, id, &err);
                }
            }
            Ok(None) => {}
            Err(ClientRequestError::Close) => break,
            Err(ClientRequestError::WebSocket(err)) => {
                debug!(%id, "connection lost: {err}");
                break;
            }
            Err(err @ (ClientRequestError::Json(_) | ClientRequestError::UnsupportedType)) => {
                reject(&tx, id, &err.into());
            }
        }
    }

    let rooms = state.disconnect(id);
    info!(%id, %peer_addr, rooms = rooms.len(), "connection closed");

    drop(tx);
    let _ = writer.await;
}

/// Report a rejected request to its originator only
fn reject(tx: &mpsc::Sender<ServerEvent>, id: ConnectionId, err: &SignalingError) {
    debug!(%id, "request rejected: {err}");
    let Some(event) = err.to_event() else {
        return;
    };
    if tx.try_send(event).is_err() {
        warn!(%id, "outbound queue full, dropping error report");
    }
}

//! TCP accept loop for the signaling relay

use crate::config::RelayConfig;
use crate::error::ServerError;
use crate::handler::handle_connection;
use crate::state::ServerState;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{info, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound relay, ready to accept connections
pub struct RelayServer {
    listener: TcpListener,
    state: ServerState,
}

impl RelayServer {
    /// Bind the listener; port 0 picks an ephemeral port
    pub async fn bind(addr: impl ToSocketAddrs, config: RelayConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: ServerState::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the registry shared with every connection
    pub fn state(&self) -> ServerState {
        self.state.clone()
    }

    /// Serve until `shutdown` resolves
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, "signaling relay listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            warn!(%peer_addr, "failed to set TCP_NODELAY: {err}");
                        }
                        tokio::spawn(handle_connection(stream, peer_addr, self.state.clone()));
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

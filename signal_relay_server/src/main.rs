//! `signal-relay` binary entry point

use anyhow::{Context, Result};
use clap::Parser;
use signal_relay_server::{
    RelayConfig, RelayServer,
    config::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_ROOM_SIZE, DEFAULT_OUTBOUND_QUEUE},
};
use signal_relay_protocol::DEFAULT_MAX_ROOM_ID_LEN;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "signal-relay")]
#[command(about = "WebSocket signaling relay for WebRTC peers")]
struct Args {
    /// Address to bind
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Maximum members per room (0 for no limit)
    #[arg(long, default_value_t = DEFAULT_MAX_ROOM_SIZE)]
    max_room_size: usize,

    /// Maximum room id length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_ROOM_ID_LEN)]
    max_room_id_len: usize,

    /// Events buffered per connection before deliveries to it are dropped
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_QUEUE)]
    outbound_queue: usize,

    /// Seconds a client may take to complete the WebSocket upgrade
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    handshake_timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "signal_relay_server=debug"
    } else {
        "signal_relay_server=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RelayConfig {
        max_room_size: args.max_room_size,
        max_room_id_len: args.max_room_id_len,
        outbound_queue: args.outbound_queue,
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
    };
    info!(?config, "starting signaling relay");

    let server = RelayServer::bind((args.host.as_str(), args.port), config)
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    server
        .serve_with_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl-C: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

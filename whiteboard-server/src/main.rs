//! Whiteboard server — hosts one shared board over WebSocket.
//!
//! Uses `whiteboard-sync` for the board and session handling; this binary
//! only parses options, installs the logger and waits for Ctrl+C.

use clap::Parser;
use log::info;

use whiteboard_sync::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(
    name = "whiteboard-server",
    about = "Real-time collaborative whiteboard server",
    version
)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "WHITEBOARD_BIND", default_value = "127.0.0.1:8765")]
    bind: String,

    /// Frames buffered per client before it is disconnected as stalled
    #[arg(long, env = "WHITEBOARD_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Maximum number of strokes kept on the board (unbounded if omitted)
    #[arg(long, env = "WHITEBOARD_MAX_STROKES")]
    max_strokes: Option<usize>,

    /// Seconds between WebSocket pings (0 disables)
    #[arg(long, env = "WHITEBOARD_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Seconds a single write to a client may take before it is dropped (0 waits forever)
    #[arg(long, env = "WHITEBOARD_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    write_timeout_secs: u64,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind_addr: cli.bind,
            outbox_capacity: cli.outbox_capacity,
            max_strokes: cli.max_strokes,
            heartbeat_interval_secs: cli.heartbeat_secs,
            write_timeout_secs: cli.write_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = SyncServer::new(Cli::parse().into());
    info!("Starting whiteboard server...");

    let listener = server.bind().await?;
    server.serve(listener, shutdown_signal()).await?;

    let stats = server.stats();
    info!(
        "Server stopped after {} connections ({} messages, {} malformed)",
        stats.total_connections, stats.total_messages, stats.malformed_messages
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

//! WebSocket listener for the shared whiteboard.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► handshake ──► Session (one task per client)
//!                                            │
//!                                            ▼
//!                                       Whiteboard
//!                                  ┌─────────┼──────────┐
//!                                  ▼         ▼          ▼
//!                           DocumentStore  Registry  BroadcastEngine
//! ```
//!
//! The server owns one [`Whiteboard`]; every accepted connection gets its own
//! task running a [`Session`] against it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::board::{BoardConfig, Whiteboard};
use crate::session::{Session, TrafficCounters};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per client before it is treated as stalled
    pub outbox_capacity: usize,
    /// Optional stroke cap (None = unbounded)
    pub max_strokes: Option<usize>,
    /// Heartbeat interval in seconds (0 = disabled)
    pub heartbeat_interval_secs: u64,
    /// Longest a single socket write may take before the client is dropped
    /// (0 = wait forever)
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            outbox_capacity: 256,
            max_strokes: None,
            heartbeat_interval_secs: 30,
            write_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    fn board_config(&self) -> BoardConfig {
        BoardConfig {
            outbox_capacity: self.outbox_capacity,
            max_strokes: self.max_strokes,
        }
    }

    fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs))
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_handshakes: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_handshakes: AtomicU64,
}

/// The whiteboard server.
pub struct SyncServer {
    config: ServerConfig,
    board: Arc<Whiteboard>,
    stats: Arc<AtomicServerStats>,
    traffic: Arc<TrafficCounters>,
}

impl SyncServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            board: Arc::new(Whiteboard::new(config.board_config())),
            stats: Arc::new(AtomicServerStats::default()),
            traffic: Arc::new(TrafficCounters::new()),
            config,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Whiteboard server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` completes.
    ///
    /// Sessions already running keep going after the accept loop stops;
    /// they end with their connections.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        self.spawn_connection(stream, addr);
                    }
                    Err(e) => log::error!("Failed to accept connection: {e}"),
                },
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let board = self.board.clone();
        let stats = self.stats.clone();
        let session = Session::new(board, Some(addr))
            .with_heartbeat(self.config.heartbeat())
            .with_write_timeout(self.config.write_timeout())
            .with_traffic(self.traffic.clone());

        tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, addr, session, stats).await {
                log::error!("Connection error from {addr}: {e}");
            }
        });
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session: Session,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.failed_handshakes.fetch_add(1, Ordering::Relaxed);
                return Err(ServerError::Handshake(e).into());
            }
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let result = session.run(ws_stream).await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        let summary = result?;
        log::debug!(
            "Session {} from {addr} ended after {} messages",
            summary.client_id,
            summary.messages
        );
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            failed_handshakes: self.stats.failed_handshakes.load(Ordering::Relaxed),
            total_messages: self.traffic.messages(),
            malformed_messages: self.traffic.malformed(),
        }
    }

    /// The shared board served by this server.
    pub fn board(&self) -> &Arc<Whiteboard> {
        &self.board
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

//! The shared board: one document, its clients, and the rules that tie
//! inbound events to document changes and outbound frames.
//!
//! Ordering:
//! ```text
//! session A ─┐                      ┌─► queue A
//! session B ─┼─► lock(document) ────┼─► queue B      (mutation + enqueue
//! session C ─┘   apply + broadcast  └─► queue C       under one lock)
//! ```
//!
//! Mutations are applied and their frames queued while the document lock
//! is held, so every client's queue sees mutation frames in exactly the
//! order the document changed. A joining client gets its `sync` snapshot
//! queued under the same lock before it becomes visible to broadcasts.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastEngine, BroadcastReport, BroadcastStats};
use crate::document::{DocumentError, DocumentStore};
use crate::protocol::{ClientId, ClientMessage, Frame, ProtocolError, ServerMessage, Stroke};
use crate::registry::{ClientHandle, ClientRegistry, DeliveryError};

/// Board configuration.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Frames buffered per client before it counts as stalled
    pub outbox_capacity: usize,
    /// Optional stroke cap (None = unbounded)
    pub max_strokes: Option<usize>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            max_strokes: None,
        }
    }
}

/// Board errors.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Could not deliver initial state: {0}")]
    Join(DeliveryError),
}

/// A freshly registered client: its identity and the receiving end of
/// its outbound queue.
#[derive(Debug)]
pub struct Membership {
    pub id: ClientId,
    pub outbox: mpsc::Receiver<Frame>,
}

/// What applying one inbound event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event was fanned out
    Broadcast(BroadcastReport),
    /// A private reply was queued for the requester
    Replied,
    /// Nothing to do (e.g. undo on an empty board)
    Unchanged,
}

/// Process-wide board state.
pub struct Whiteboard {
    config: BoardConfig,
    document: DocumentStore,
    clients: Arc<ClientRegistry>,
    broadcast: BroadcastEngine,
}

impl Whiteboard {
    pub fn new(config: BoardConfig) -> Self {
        let clients = Arc::new(ClientRegistry::new());
        Self {
            document: DocumentStore::new(config.max_strokes),
            broadcast: BroadcastEngine::new(clients.clone()),
            clients,
            config,
        }
    }

    /// Register a new client and queue the current board as its first frame.
    pub async fn join(&self, addr: Option<SocketAddr>) -> Result<Membership, BoardError> {
        let (tx, outbox) = mpsc::channel(self.config.outbox_capacity.max(1));
        let handle = ClientHandle::new(ClientId::new(), addr, tx);
        let id = handle.id();

        let document = self.document.lock().await;
        let frame = ServerMessage::Sync { lines: document.snapshot() }.to_frame()?;
        handle.try_deliver(&frame).map_err(BoardError::Join)?;
        self.clients.register(handle).await;
        let strokes = document.len();
        drop(document);

        log::debug!("Client {id} joined with {strokes} strokes on the board");
        Ok(Membership { id, outbox })
    }

    /// Remove a client. Safe to call more than once.
    pub async fn leave(&self, id: ClientId) -> bool {
        let removed = self.clients.deregister(&id).await.is_some();
        if removed {
            log::debug!("Client {id} left");
        }
        removed
    }

    /// Apply one inbound event from `origin`.
    pub async fn apply(&self, origin: ClientId, msg: ClientMessage) -> Result<Outcome, BoardError> {
        match msg {
            ClientMessage::Draw { line } => self.draw(line).await,
            ClientMessage::Clear => self.clear().await,
            ClientMessage::Undo => self.undo().await,
            ClientMessage::Sync => self.sync(origin).await,
            ClientMessage::MouseMove { coords } => {
                self.relay(origin, ServerMessage::MouseMove { coords, client_id: origin })
                    .await
            }
            ClientMessage::MouseDown { coords } => {
                self.relay(origin, ServerMessage::MouseDown { coords, client_id: origin })
                    .await
            }
            ClientMessage::MouseUp => {
                self.relay(origin, ServerMessage::MouseUp { client_id: origin })
                    .await
            }
        }
    }

    async fn draw(&self, line: Stroke) -> Result<Outcome, BoardError> {
        let mut document = self.document.lock().await;
        let index = document.append(line.clone())?;
        let report = self.broadcast.broadcast(&ServerMessage::Draw { line }).await?;
        log::debug!("Stroke {index} appended, sent to {} clients", report.delivered);
        Ok(Outcome::Broadcast(report))
    }

    async fn clear(&self) -> Result<Outcome, BoardError> {
        let mut document = self.document.lock().await;
        let removed = document.clear();
        let report = self.broadcast.broadcast(&ServerMessage::Clear).await?;
        log::debug!("Board cleared ({removed} strokes removed)");
        Ok(Outcome::Broadcast(report))
    }

    async fn undo(&self) -> Result<Outcome, BoardError> {
        let mut document = self.document.lock().await;
        let Some(removed_line) = document.pop_last() else {
            return Ok(Outcome::Unchanged);
        };
        let report = self
            .broadcast
            .broadcast(&ServerMessage::Undo { removed_line })
            .await?;
        log::debug!("Undo applied, {} strokes remain", document.len());
        Ok(Outcome::Broadcast(report))
    }

    async fn sync(&self, origin: ClientId) -> Result<Outcome, BoardError> {
        let document = self.document.lock().await;
        let reply = ServerMessage::Sync { lines: document.snapshot() };
        if self.broadcast.send_to(origin, &reply).await? {
            Ok(Outcome::Replied)
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    async fn relay(&self, origin: ClientId, msg: ServerMessage) -> Result<Outcome, BoardError> {
        let report = self.broadcast.broadcast_except(&msg, origin).await?;
        log::trace!("Relayed {} from {origin} to {} clients", msg.action(), report.delivered);
        Ok(Outcome::Broadcast(report))
    }

    /// Consistent copy of the current strokes.
    pub async fn snapshot(&self) -> Vec<Stroke> {
        self.document.snapshot().await
    }

    pub async fn client_count(&self) -> usize {
        self.clients.len().await
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.ids().await
    }

    pub async fn is_connected(&self, id: &ClientId) -> bool {
        self.clients.contains(id).await
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }
}

impl Default for Whiteboard {
    fn default() -> Self {
        Self::new(BoardConfig::default())
    }
}

//! Live client membership.
//!
//! A [`ClientHandle`] exists in the registry exactly while its connection is
//! usable. The registry holds the only sender of each client's outbound
//! queue, so removing a handle also closes that queue and ends the
//! connection's writer side.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ClientId, Frame};

/// Why a frame could not be queued for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The client stopped draining its queue
    #[error("Outbound queue full")]
    QueueFull,
    /// The connection is gone
    #[error("Connection closed")]
    Closed,
}

/// One connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    addr: Option<SocketAddr>,
    outbox: mpsc::Sender<Frame>,
}

impl ClientHandle {
    pub fn new(id: ClientId, addr: Option<SocketAddr>, outbox: mpsc::Sender<Frame>) -> Self {
        Self { id, addr, outbox }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        self.outbox.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Set of currently connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: ClientHandle) {
        self.clients.write().await.insert(handle.id, handle);
    }

    /// Remove a client. Removing an absent client is a no-op.
    pub async fn deregister(&self, id: &ClientId) -> Option<ClientHandle> {
        self.clients.write().await.remove(id)
    }

    /// Membership at this instant, for one broadcast round.
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    pub async fn get(&self, id: &ClientId) -> Option<ClientHandle> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

//! Fan-out of server frames to every registered client.
//!
//! Each round encodes the message once, takes a membership snapshot and
//! queues the shared frame on every client with a non-blocking send. A
//! client whose queue is full or closed is evicted; the rest of the round
//! carries on. Queueing never waits, so one stalled client cannot delay
//! delivery to the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ClientId, Frame, ProtocolError, ServerMessage};
use crate::registry::{ClientHandle, ClientRegistry, DeliveryError};

/// Outcome of one broadcast round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients in the membership snapshot (minus any excluded origin)
    pub recipients: usize,
    /// Frames successfully queued
    pub delivered: usize,
    /// Clients removed because delivery failed
    pub evicted: Vec<ClientId>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub rounds: u64,
    pub frames_delivered: u64,
    pub clients_evicted: u64,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    rounds: AtomicU64,
    frames_delivered: AtomicU64,
    clients_evicted: AtomicU64,
}

/// Delivers server frames to the registry's membership.
pub struct BroadcastEngine {
    registry: Arc<ClientRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Deliver to every client.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Result<BroadcastReport, ProtocolError> {
        let frame = msg.to_frame()?;
        Ok(self.broadcast_frame(&frame, None).await)
    }

    /// Deliver to every client except `origin`.
    pub async fn broadcast_except(
        &self,
        msg: &ServerMessage,
        origin: ClientId,
    ) -> Result<BroadcastReport, ProtocolError> {
        let frame = msg.to_frame()?;
        Ok(self.broadcast_frame(&frame, Some(origin)).await)
    }

    /// Deliver a pre-encoded frame.
    pub async fn broadcast_frame(&self, frame: &Frame, except: Option<ClientId>) -> BroadcastReport {
        let members = self.registry.snapshot().await;
        let mut report = BroadcastReport::default();
        let mut failed: Vec<(ClientHandle, DeliveryError)> = Vec::new();

        for handle in members {
            if Some(handle.id()) == except {
                continue;
            }
            report.recipients += 1;
            match handle.try_deliver(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => failed.push((handle, e)),
            }
        }

        for (handle, reason) in failed {
            self.evict(&handle, reason).await;
            report.evicted.push(handle.id());
        }

        self.stats.rounds.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        report
    }

    /// Reply privately to one client.
    ///
    /// Returns `Ok(false)` if the client is unknown or was evicted by this
    /// send.
    pub async fn send_to(&self, id: ClientId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let Some(handle) = self.registry.get(&id).await else {
            return Ok(false);
        };
        let frame = msg.to_frame()?;
        match handle.try_deliver(&frame) {
            Ok(()) => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.evict(&handle, e).await;
                Ok(false)
            }
        }
    }

    async fn evict(&self, handle: &ClientHandle, reason: DeliveryError) {
        if self.registry.deregister(&handle.id()).await.is_some() {
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
            match handle.addr() {
                Some(addr) => log::warn!("Evicting client {} ({addr}): {reason}", handle.id()),
                None => log::warn!("Evicting client {}: {reason}", handle.id()),
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            clients_evicted: self.stats.clients_evicted.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Stroke;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn add_client(registry: &ClientRegistry, capacity: usize) -> (ClientId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ClientId::new();
        registry.register(ClientHandle::new(id, None, tx)).await;
        (id, rx)
    }

    fn draw(n: u64) -> ServerMessage {
        ServerMessage::Draw { line: Stroke::new(json!(n)) }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_everyone() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (_a, mut rx_a) = add_client(&registry, 8).await;
        let (_b, mut rx_b) = add_client(&registry, 8).await;
        let (_c, mut rx_c) = add_client(&registry, 8).await;

        let report = engine.broadcast(&draw(1)).await.unwrap();
        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());

        let expected = draw(1).encode().unwrap();
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(&*rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_broken_client_is_isolated() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (_a, mut rx_a) = add_client(&registry, 8).await;
        let (broken, rx_broken) = add_client(&registry, 8).await;
        let (_c, mut rx_c) = add_client(&registry, 8).await;
        drop(rx_broken);

        let report = engine.broadcast(&draw(7)).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![broken]);
        assert!(!registry.contains(&broken).await);
        assert_eq!(registry.len().await, 2);

        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
        assert_eq!(engine.stats().clients_evicted, 1);
    }

    #[tokio::test]
    async fn test_stalled_client_is_evicted_without_blocking() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (stalled, _rx_stalled) = add_client(&registry, 1).await;
        let (_ok, mut rx_ok) = add_client(&registry, 16).await;

        engine.broadcast(&draw(1)).await.unwrap();
        let report = engine.broadcast(&draw(2)).await.unwrap();

        assert_eq!(report.evicted, vec![stalled]);
        assert_eq!(rx_ok.recv().await.map(|f| f.to_string()), Some(draw(1).encode().unwrap()));
        assert_eq!(rx_ok.recv().await.map(|f| f.to_string()), Some(draw(2).encode().unwrap()));
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_origin() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (origin, mut rx_origin) = add_client(&registry, 8).await;
        let (_other, mut rx_other) = add_client(&registry, 8).await;

        let msg = ServerMessage::MouseUp { client_id: origin };
        let report = engine.broadcast_except(&msg, origin).await.unwrap();
        assert_eq!(report.recipients, 1);
        assert_eq!(report.delivered, 1);

        assert!(rx_other.recv().await.is_some());
        assert!(rx_origin.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_single_client() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (a, mut rx_a) = add_client(&registry, 8).await;
        let (_b, mut rx_b) = add_client(&registry, 8).await;

        let msg = ServerMessage::Sync { lines: vec![] };
        assert!(engine.send_to(a, &msg).await.unwrap());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());

        assert!(!engine.send_to(ClientId::new(), &msg).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_round() {
        let engine = BroadcastEngine::new(Arc::new(ClientRegistry::new()));
        let report = engine.broadcast(&ServerMessage::Clear).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(engine.stats().rounds, 1);
    }
}

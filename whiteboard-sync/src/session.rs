//! Per-connection control loop.
//!
//! ```text
//! Connecting ──join + sync queued──► Active ──close / I/O error / evicted──► Closed
//! ```
//!
//! While active the session multiplexes three sources with `select!`:
//! inbound frames from the socket, the client's outbound queue, and an
//! optional heartbeat ticker. The session works over any WebSocket-framed
//! stream/sink pair so the transport handshake stays outside this module.
//!
//! Every socket write is bounded by the write timeout. A peer that stops
//! reading therefore ends its own session instead of pinning the task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::board::{BoardError, Membership, Whiteboard};
use crate::protocol::{ClientId, ClientMessage};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream
    ClientClosed,
    ReadError,
    WriteError,
    /// Removed from the registry after a failed delivery
    Evicted,
    HeartbeatFailed,
}

/// Counters for one finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub client_id: ClientId,
    pub reason: CloseReason,
    /// Inbound data frames received
    pub messages: u64,
    /// Frames that failed to decode
    pub malformed: u64,
    /// Decoded events the board refused (e.g. stroke cap reached)
    pub rejected: u64,
}

/// Default bound on a single socket write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound frame counters shared by many sessions, updated as frames
/// arrive rather than when a session ends.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    messages: AtomicU64,
    malformed: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
enum WriteFailure {
    #[error(transparent)]
    Socket(#[from] WsError),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
}

/// One client connection.
pub struct Session {
    board: Arc<Whiteboard>,
    addr: Option<SocketAddr>,
    heartbeat: Option<Duration>,
    write_timeout: Option<Duration>,
    traffic: Option<Arc<TrafficCounters>>,
    state: SessionState,
}

impl Session {
    pub fn new(board: Arc<Whiteboard>, addr: Option<SocketAddr>) -> Self {
        Self {
            board,
            addr,
            heartbeat: None,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            traffic: None,
            state: SessionState::Connecting,
        }
    }

    /// Ping the peer every `period`; a failed ping ends the session.
    pub fn with_heartbeat(mut self, period: Option<Duration>) -> Self {
        self.heartbeat = period.filter(|p| !p.is_zero());
        self
    }

    /// Bound each socket write; `None` or zero waits forever.
    pub fn with_write_timeout(mut self, limit: Option<Duration>) -> Self {
        self.write_timeout = limit.filter(|l| !l.is_zero());
        self
    }

    /// Also count inbound frames into `traffic`.
    pub fn with_traffic(mut self, traffic: Arc<TrafficCounters>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the connection until it closes.
    ///
    /// Fails only if the client could not be registered; every later
    /// problem ends the session normally and is reported in the summary.
    pub async fn run<S>(mut self, ws: S) -> Result<SessionSummary, BoardError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let Membership { id, mut outbox } = self.board.join(self.addr).await?;
        self.state = SessionState::Active;
        log::info!("Client {id} connected from {}", self.peer());

        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut summary = SessionSummary {
            client_id: id,
            reason: CloseReason::ClientClosed,
            messages: 0,
            malformed: 0,
            rejected: 0,
        };

        let reason = loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(id, text.as_str(), &mut summary).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(id, text, &mut summary).await,
                        Err(_) => {
                            self.count(&mut summary, true);
                            log::warn!("Dropping non-UTF-8 binary frame from {id}");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write(&mut sink, Message::Pong(data), self.write_timeout).await {
                            log::warn!("Write error to {id}: {e}");
                            break CloseReason::WriteError;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Read error from {id}: {e}");
                        break CloseReason::ReadError;
                    }
                },

                outbound = outbox.recv() => match outbound {
                    Some(frame) => {
                        let msg = Message::Text(frame.to_string().into());
                        if let Err(e) = write(&mut sink, msg, self.write_timeout).await {
                            log::warn!("Write error to {id}: {e}");
                            break CloseReason::WriteError;
                        }
                    }
                    None => {
                        let _ = write(&mut sink, Message::Close(None), self.write_timeout).await;
                        break CloseReason::Evicted;
                    }
                },

                _ = next_tick(&mut heartbeat) => {
                    let ping = Message::Ping(Default::default());
                    if let Err(e) = write(&mut sink, ping, self.write_timeout).await {
                        log::warn!("Heartbeat to {id} failed: {e}");
                        break CloseReason::HeartbeatFailed;
                    }
                }
            }
        };

        self.board.leave(id).await;
        self.state = SessionState::Closed;
        summary.reason = reason;
        log::info!(
            "Client {id} disconnected from {} ({reason:?}, {} messages)",
            self.peer(),
            summary.messages
        );
        Ok(summary)
    }

    async fn handle_text(&self, id: ClientId, text: &str, summary: &mut SessionSummary) {
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => {
                self.count(summary, false);
                msg
            }
            Err(e) => {
                self.count(summary, true);
                log::warn!("Dropping message from {id}: {e}");
                return;
            }
        };

        let action = msg.action();
        if let Err(e) = self.board.apply(id, msg).await {
            summary.rejected += 1;
            log::warn!("Could not apply {action} from {id}: {e}");
        }
    }

    fn count(&self, summary: &mut SessionSummary, malformed: bool) {
        summary.messages += 1;
        summary.malformed += u64::from(malformed);
        if let Some(traffic) = &self.traffic {
            traffic.messages.fetch_add(1, Ordering::Relaxed);
            if malformed {
                traffic.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn peer(&self) -> String {
        self.addr.map_or_else(|| "local".to_string(), |a| a.to_string())
    }
}

async fn write<W>(sink: &mut W, msg: Message, limit: Option<Duration>) -> Result<(), WriteFailure>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, sink.send(msg))
            .await
            .map_err(|_| WriteFailure::TimedOut(limit))?
            .map_err(WriteFailure::from),
        None => Ok(sink.send(msg).await?),
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardConfig;
    use crate::protocol::{ServerMessage, Stroke};
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    type Client = WebSocketStream<DuplexStream>;

    async fn open(board: &Arc<Whiteboard>) -> (Client, JoinHandle<SessionSummary>) {
        start(Session::new(board.clone(), None), 64 * 1024).await
    }

    async fn start(session: Session, buffer: usize) -> (Client, JoinHandle<SessionSummary>) {
        let (server_io, client_io) = tokio::io::duplex(buffer);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let task = tokio::spawn(async move { session.run(server_ws).await.unwrap() });
        (client_ws, task)
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerMessage::decode(text.as_str()).unwrap();
            }
        }
    }

    async fn send(ws: &mut Client, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_starts_with_sync() {
        let board = Arc::new(Whiteboard::default());
        let (mut ws, _task) = open(&board).await;
        assert_eq!(recv(&mut ws).await, ServerMessage::Sync { lines: vec![] });
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_session_open() {
        let board = Arc::new(Whiteboard::default());
        let (mut ws, task) = open(&board).await;
        let _ = recv(&mut ws).await;

        send(&mut ws, "{{{ not json").await;
        send(&mut ws, r#"{"action":"teleport"}"#).await;
        send(&mut ws, r#"{"action":"draw","line":{"p":1}}"#).await;

        assert_eq!(
            recv(&mut ws).await,
            ServerMessage::Draw { line: Stroke::new(json!({"p": 1})) }
        );

        ws.close(None).await.unwrap();
        let summary = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.malformed, 2);
        assert_eq!(board.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_binary_utf8_frames_are_accepted() {
        let board = Arc::new(Whiteboard::default());
        let (mut ws, _task) = open(&board).await;
        let _ = recv(&mut ws).await;

        ws.send(Message::Binary(br#"{"action":"draw","line":[1]}"#.to_vec().into()))
            .await
            .unwrap();
        assert_eq!(recv(&mut ws).await, ServerMessage::Draw { line: Stroke::new(json!([1])) });
    }

    #[tokio::test]
    async fn test_dropped_connection_deregisters() {
        let board = Arc::new(Whiteboard::default());
        let (mut ws, task) = open(&board).await;
        let _ = recv(&mut ws).await;
        assert_eq!(board.client_count().await, 1);

        drop(ws);
        let summary = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_ne!(summary.reason, CloseReason::Evicted);
        assert_eq!(board.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_evicted_client_is_closed() {
        let board = Arc::new(Whiteboard::default());
        let (mut ws, task) = open(&board).await;
        let _ = recv(&mut ws).await;

        // Simulate the broadcast engine giving up on this client.
        let id = board.client_ids().await[0];
        board.leave(id).await;

        let summary = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Evicted);
        assert_eq!(summary.client_id, id);
    }

    #[tokio::test]
    async fn test_heartbeat_pings_client() {
        let board = Arc::new(Whiteboard::default());
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let session = Session::new(board.clone(), None)
            .with_heartbeat(Some(Duration::from_millis(20)));
        tokio::spawn(async move { session.run(server_ws).await });

        let mut saw_ping = false;
        for _ in 0..5 {
            let msg = timeout(Duration::from_secs(2), client_ws.next()).await.unwrap().unwrap().unwrap();
            if msg.is_ping() {
                saw_ping = true;
                break;
            }
        }
        assert!(saw_ping);
    }

    #[tokio::test]
    async fn test_stalled_reader_is_disconnected() {
        let board = Arc::new(Whiteboard::new(BoardConfig {
            outbox_capacity: 4,
            ..BoardConfig::default()
        }));
        let session = Session::new(board.clone(), None)
            .with_write_timeout(Some(Duration::from_millis(100)));
        // The client end is kept open but never read.
        let (_stalled, task) = start(session, 256).await;

        let writer = board.join(None).await.unwrap();
        while board.client_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let wide = "x".repeat(200);
        for i in 0..50 {
            board
                .apply(writer.id, ClientMessage::draw(json!({ "i": i, "pad": wide })))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let summary = timeout(Duration::from_secs(3), task)
            .await
            .expect("stalled session did not end")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::WriteError);
        assert!(!board.is_connected(&summary.client_id).await);
    }

    #[tokio::test]
    async fn test_traffic_counted_while_open() {
        let board = Arc::new(Whiteboard::default());
        let traffic = Arc::new(TrafficCounters::new());
        let session = Session::new(board.clone(), None).with_traffic(traffic.clone());
        let (mut ws, task) = start(session, 64 * 1024).await;
        let _ = recv(&mut ws).await;

        send(&mut ws, "nope").await;
        send(&mut ws, r#"{"action":"draw","line":[1]}"#).await;
        let _ = recv(&mut ws).await;

        assert_eq!(traffic.messages(), 2);
        assert_eq!(traffic.malformed(), 1);
        assert!(!task.is_finished());
    }

    #[test]
    fn test_new_session_is_connecting() {
        let session = Session::new(Arc::new(Whiteboard::default()), None)
            .with_heartbeat(Some(Duration::ZERO));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.heartbeat.is_none());
        assert_eq!(session.write_timeout, Some(DEFAULT_WRITE_TIMEOUT));
        assert!(session.with_write_timeout(Some(Duration::ZERO)).write_timeout.is_none());
    }
}

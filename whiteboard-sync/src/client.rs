//! WebSocket client for the whiteboard protocol.
//!
//! Provides:
//! - Connection setup with a background reader task
//! - Typed senders for every client action
//! - Decoded server frames delivered on an mpsc channel

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, Stroke};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A connected whiteboard client.
pub struct WhiteboardClient {
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    reader: JoinHandle<()>,
}

impl WhiteboardClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8765`).
    ///
    /// Returns the client and a receiver of decoded server frames. The
    /// first frame is always the server's `sync`.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ServerMessage>), ClientError> {
        Self::connect_with_capacity(url, 1024).await
    }

    pub async fn connect_with_capacity(
        url: &str,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<ServerMessage>), ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (writer, reader) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));

        let reader = tokio::spawn(Self::read_loop(reader, event_tx));
        log::debug!("Connected to {url}");

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                reader,
            },
            event_rx,
        ))
    }

    async fn read_loop(mut reader: SplitStream<WsStream>, events: mpsc::Sender<ServerMessage>) {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring server frame: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Client read error: {e}");
                    break;
                }
            }
        }
    }

    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = msg.encode()?;
        self.send_raw(text).await
    }

    /// Send an arbitrary text frame, bypassing encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.into().into())).await?;
        Ok(())
    }

    pub async fn draw(&self, line: impl Into<Stroke>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Draw { line: line.into() }).await
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Clear).await
    }

    pub async fn undo(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Undo).await
    }

    pub async fn request_sync(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Sync).await
    }

    pub async fn mouse_move(&self, coords: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::MouseMove { coords }).await
    }

    pub async fn mouse_down(&self, coords: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::MouseDown { coords }).await
    }

    pub async fn mouse_up(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::MouseUp).await
    }

    /// Send a close frame and stop reading.
    pub async fn close(self) -> Result<(), ClientError> {
        let result = self.writer.lock().await.close().await;
        self.reader.abort();
        result.map_err(ClientError::from)
    }
}

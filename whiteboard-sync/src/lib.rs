//! # whiteboard-sync — Real-time shared whiteboard server
//!
//! Keeps one ordered list of strokes and every connected client's view of it
//! consistent as edits stream in over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text    ┌──────────────┐
//! │ Client       │ ◄────────────► │ Session      │  one task per connection
//! └──────────────┘                └──────┬───────┘
//!                                        │ apply(event)
//!                                        ▼
//!                                 ┌──────────────┐
//!                                 │ Whiteboard   │
//!                                 └──────┬───────┘
//!                    ┌───────────────────┼───────────────────┐
//!                    ▼                   ▼                   ▼
//!             ┌─────────────┐    ┌──────────────┐    ┌───────────────┐
//!             │DocumentStore│    │ClientRegistry│◄───│BroadcastEngine│
//!             │ (strokes)   │    │ (handles)    │    │ (fan-out)     │
//!             └─────────────┘    └──────────────┘    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages (`action`-tagged)
//! - [`document`] — Ordered stroke list behind a single-writer lock
//! - [`registry`] — Connected client handles and their outbound queues
//! - [`broadcast`] — Fan-out with per-client failure isolation
//! - [`board`] — Ties the three together; applies inbound events
//! - [`session`] — Per-connection control loop
//! - [`server`] — TCP/WebSocket listener
//! - [`client`] — Protocol client

pub mod protocol;
pub mod document;
pub mod registry;
pub mod broadcast;
pub mod board;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientId, ClientMessage, Frame, ProtocolError, ServerMessage, Stroke};
pub use document::{Document, DocumentError, DocumentStore};
pub use registry::{ClientHandle, ClientRegistry, DeliveryError};
pub use broadcast::{BroadcastEngine, BroadcastReport, BroadcastStats};
pub use board::{BoardConfig, BoardError, Membership, Outcome, Whiteboard};
pub use session::{CloseReason, Session, SessionState, SessionSummary, TrafficCounters};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ClientError, WhiteboardClient};

//! JSON text protocol spoken between whiteboard clients and the server.
//!
//! Every frame is a UTF-8 JSON object discriminated by its `action` field:
//! ```text
//! client → server                       server → client
//! ─────────────────────────────────     ──────────────────────────────────────────
//! {"action":"draw","line":…}            {"action":"draw","line":…}
//! {"action":"clear"}                    {"action":"clear"}
//! {"action":"sync"}                     {"action":"sync","lines":[…]}
//! {"action":"undo"}                     {"action":"undo","removed_line":…}
//! {"action":"mouse_move","coords":…}    {"action":"mouse_move","coords":…,"client_id":"…"}
//! {"action":"mouse_down","coords":…}    {"action":"mouse_down","coords":…,"client_id":"…"}
//! {"action":"mouse_up"}                 {"action":"mouse_up","client_id":"…"}
//! ```
//!
//! Stroke and cursor payloads are opaque to the server: they are stored and
//! relayed verbatim.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A pre-encoded outbound text frame, shared between all recipients of a
/// broadcast round.
pub type Frame = Arc<str>;

/// One drawn line. The server never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stroke(Value);

impl Stroke {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Whether the payload carries no drawing: `null`, `false`, zero, or
    /// an empty string, array or object.
    pub fn is_blank(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
        }
    }
}

impl From<Value> for Stroke {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Stable per-connection identity, assigned when a client registers.
///
/// Used to tag cursor events so other clients can tell cursors apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create with an explicit UUID (for testing)
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Append a stroke to the board
    Draw { line: Stroke },
    /// Wipe the board
    Clear,
    /// Request the full stroke list
    Sync,
    /// Remove the most recent stroke
    Undo,
    /// Pointer moved (ephemeral)
    MouseMove {
        #[serde(default)]
        coords: Value,
    },
    /// Pointer pressed (ephemeral)
    MouseDown {
        #[serde(default)]
        coords: Value,
    },
    /// Pointer released (ephemeral)
    MouseUp,
}

impl ClientMessage {
    pub fn draw(line: impl Into<Stroke>) -> Self {
        Self::Draw { line: line.into() }
    }

    /// Whether this message changes the stroke sequence.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::Clear | Self::Undo)
    }

    /// Wire name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::Clear => "clear",
            Self::Sync => "sync",
            Self::Undo => "undo",
            Self::MouseMove { .. } => "mouse_move",
            Self::MouseDown { .. } => "mouse_down",
            Self::MouseUp => "mouse_up",
        }
    }

    /// Decode an inbound text frame.
    ///
    /// A `draw` whose `line` is missing or blank (see [`Stroke::is_blank`])
    /// is rejected with [`ProtocolError::MissingStroke`], so empty payloads
    /// never reach the board.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let Self::Draw { line } = &msg {
            if line.is_blank() {
                return Err(ProtocolError::MissingStroke);
            }
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    Draw { line: Stroke },
    Clear,
    /// Full board state; always the first frame a client receives
    Sync { lines: Vec<Stroke> },
    Undo { removed_line: Stroke },
    MouseMove { coords: Value, client_id: ClientId },
    MouseDown { coords: Value, client_id: ClientId },
    MouseUp { client_id: ClientId },
}

impl ServerMessage {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::Clear => "clear",
            Self::Sync { .. } => "sync",
            Self::Undo { .. } => "undo",
            Self::MouseMove { .. } => "mouse_move",
            Self::MouseDown { .. } => "mouse_down",
            Self::MouseUp { .. } => "mouse_up",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Encode into a shareable frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Frame::from)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Draw message without a line")]
    MissingStroke,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

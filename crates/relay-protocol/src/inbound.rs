//! Client-originated control frames.
//!
//! Clients send `{"type": <tag>, "data": {...}}`. Parsing is lenient about the
//! body: a recognised tag with a missing or invalid field still parses, leaving
//! the field as `None` so the router can drop it without closing the socket.

use crate::frames::UserStatus;
use serde::Deserialize;
use uuid::Uuid;

/// Raw inbound frame shape before interpretation.
#[derive(Debug, Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// An interpreted client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Application-level keepalive.
    Ping,
    /// The user started typing in a room.
    TypingStart { room_id: Option<Uuid> },
    /// The user stopped typing in a room.
    TypingStop { room_id: Option<Uuid> },
    /// The user changed their presence status.
    StatusChange { status: Option<UserStatus> },
    /// A tag the gateway does not understand.
    Unknown(String),
}

impl ClientFrame {
    /// Parse a client frame from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON object with a string `type`.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawClientFrame = serde_json::from_slice(data)?;
        Ok(Self::interpret(raw))
    }

    fn interpret(raw: RawClientFrame) -> Self {
        match raw.kind.as_str() {
            "ping" => ClientFrame::Ping,
            "typing_start" => ClientFrame::TypingStart {
                room_id: room_id_field(&raw.data),
            },
            "typing_stop" => ClientFrame::TypingStop {
                room_id: room_id_field(&raw.data),
            },
            "user_status_change" => ClientFrame::StatusChange {
                status: raw
                    .data
                    .get("status")
                    .and_then(|s| s.as_str())
                    .and_then(|s| s.parse().ok()),
            },
            _ => ClientFrame::Unknown(raw.kind),
        }
    }

    /// Wire tag of this frame.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            ClientFrame::Ping => "ping",
            ClientFrame::TypingStart { .. } => "typing_start",
            ClientFrame::TypingStop { .. } => "typing_stop",
            ClientFrame::StatusChange { .. } => "user_status_change",
            ClientFrame::Unknown(tag) => tag,
        }
    }
}

fn room_id_field(data: &serde_json::Value) -> Option<Uuid> {
    data.get("room_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

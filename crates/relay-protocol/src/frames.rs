//! Outbound frame types for the Relay protocol.
//!
//! Every frame the server pushes to a client is a JSON object of the form
//! `{"type": <tag>, "data": <payload or null>, "timestamp": <RFC3339>, "id": <uuid>}`.
//! The payload is a tagged union so each tag carries a typed body.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Frame type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Ping,
    Pong,
    Auth,
    Message,
    MessageEdit,
    MessageDelete,
    MessageReaction,
    TypingStart,
    TypingStop,
    UserJoin,
    UserLeave,
    UserStatusChange,
    Notification,
    Error,
}

impl FrameType {
    /// Wire tag for this frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Auth => "auth",
            FrameType::Message => "message",
            FrameType::MessageEdit => "message_edit",
            FrameType::MessageDelete => "message_delete",
            FrameType::MessageReaction => "message_reaction",
            FrameType::TypingStart => "typing_start",
            FrameType::TypingStop => "typing_stop",
            FrameType::UserJoin => "user_join",
            FrameType::UserLeave => "user_leave",
            FrameType::UserStatusChange => "user_status_change",
            FrameType::Notification => "notification",
            FrameType::Error => "error",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
    Busy,
    Invisible,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
            UserStatus::Invisible => "invisible",
        }
    }
}

impl FromStr for UserStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "offline" => Ok(UserStatus::Offline),
            "away" => Ok(UserStatus::Away),
            "busy" => Ok(UserStatus::Busy),
            "invisible" => Ok(UserStatus::Invisible),
            _ => Err("Invalid user status"),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent once when a connection has been admitted by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAck {
    pub status: String,
    pub user_id: Uuid,
    pub device_id: String,
}

impl AuthAck {
    #[must_use]
    pub fn connected(user_id: Uuid, device_id: impl Into<String>) -> Self {
        Self {
            status: "connected".to_string(),
            user_id,
            device_id: device_id.into(),
        }
    }
}

/// Typing indicator body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub room_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Body of `user_join` / `user_leave` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub room_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Body of `user_status_change` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: UserStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Whether a reaction was added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Body of `message_reaction` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub action: ReactionAction,
    pub room_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub data: serde_json::Value,
}

/// Body of `notification` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Notification kind, e.g. `room_created` or `member_added`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Body of `error` frames. Reserved; the gateway does not emit these today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// The tagged payload of an outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Ping,
    Pong,
    Auth(AuthAck),
    Message(serde_json::Value),
    MessageEdit(serde_json::Value),
    MessageDelete(serde_json::Value),
    MessageReaction(ReactionPayload),
    TypingStart(TypingPayload),
    TypingStop(TypingPayload),
    UserJoin(MembershipPayload),
    UserLeave(MembershipPayload),
    UserStatusChange(StatusPayload),
    Notification(NotificationPayload),
    Error(ErrorPayload),
}

impl FramePayload {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::Ping => FrameType::Ping,
            FramePayload::Pong => FrameType::Pong,
            FramePayload::Auth(_) => FrameType::Auth,
            FramePayload::Message(_) => FrameType::Message,
            FramePayload::MessageEdit(_) => FrameType::MessageEdit,
            FramePayload::MessageDelete(_) => FrameType::MessageDelete,
            FramePayload::MessageReaction(_) => FrameType::MessageReaction,
            FramePayload::TypingStart(_) => FrameType::TypingStart,
            FramePayload::TypingStop(_) => FrameType::TypingStop,
            FramePayload::UserJoin(_) => FrameType::UserJoin,
            FramePayload::UserLeave(_) => FrameType::UserLeave,
            FramePayload::UserStatusChange(_) => FrameType::UserStatusChange,
            FramePayload::Notification(_) => FrameType::Notification,
            FramePayload::Error(_) => FrameType::Error,
        }
    }

    /// Create a notification payload.
    #[must_use]
    pub fn notification(
        kind: impl Into<String>,
        room_id: Option<Uuid>,
        user_id: Option<Uuid>,
        data: Option<serde_json::Value>,
    ) -> Self {
        FramePayload::Notification(NotificationPayload {
            kind: kind.into(),
            room_id,
            user_id,
            data,
        })
    }

    /// Create a `user_leave` payload.
    #[must_use]
    pub fn user_leave(room_id: Uuid, user_id: Uuid, username: Option<String>) -> Self {
        FramePayload::UserLeave(MembershipPayload {
            room_id,
            user_id: Some(user_id),
            username,
            data: None,
        })
    }

    /// Create a typing payload; `started` selects start or stop.
    #[must_use]
    pub fn typing(started: bool, room_id: Uuid, user_id: Uuid, username: Option<String>) -> Self {
        let body = TypingPayload {
            room_id,
            user_id: Some(user_id),
            username,
        };
        if started {
            FramePayload::TypingStart(body)
        } else {
            FramePayload::TypingStop(body)
        }
    }
}

/// A server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// Unique frame identifier.
    pub id: String,
    /// When the frame was created.
    pub timestamp: DateTime<Utc>,
    /// Tagged body.
    pub payload: FramePayload,
}

impl OutboundFrame {
    /// Create a new frame with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: FramePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(FramePayload::Pong)
    }
}

impl Serialize for OutboundFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("type", &self.frame_type())?;
        match &self.payload {
            FramePayload::Ping | FramePayload::Pong => map.serialize_entry("data", &())?,
            FramePayload::Auth(body) => map.serialize_entry("data", body)?,
            FramePayload::Message(body)
            | FramePayload::MessageEdit(body)
            | FramePayload::MessageDelete(body) => map.serialize_entry("data", body)?,
            FramePayload::MessageReaction(body) => map.serialize_entry("data", body)?,
            FramePayload::TypingStart(body) | FramePayload::TypingStop(body) => {
                map.serialize_entry("data", body)?
            }
            FramePayload::UserJoin(body) | FramePayload::UserLeave(body) => {
                map.serialize_entry("data", body)?
            }
            FramePayload::UserStatusChange(body) => map.serialize_entry("data", body)?,
            FramePayload::Notification(body) => map.serialize_entry("data", body)?,
            FramePayload::Error(body) => map.serialize_entry("data", body)?,
        }
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

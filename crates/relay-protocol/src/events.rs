//! Domain events exchanged over the pub/sub bus.
//!
//! Services outside the gateway publish facts such as "message sent" or
//! "user joined room" as JSON envelopes. The envelope keeps the loosely-typed
//! wire shape; [`DomainEvent`] lifts it into a typed [`EventKind`] using the
//! dotted type string as the discriminant.

use crate::codec::ProtocolError;
use crate::frames::UserStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Canonical dotted event types.
pub mod types {
    pub const USER_ONLINE: &str = "user.online";
    pub const USER_OFFLINE: &str = "user.offline";
    pub const USER_TYPING_START: &str = "user.typing.start";
    pub const USER_TYPING_STOP: &str = "user.typing.stop";
    pub const USER_STATUS_CHANGE: &str = "user.status.change";
    pub const USER_PROFILE_UPDATE: &str = "user.profile.update";

    pub const ROOM_CREATE: &str = "room.create";
    pub const ROOM_JOIN: &str = "room.join";
    pub const ROOM_LEAVE: &str = "room.leave";
    pub const ROOM_MEMBER_ADD: &str = "room.member.add";
    pub const ROOM_MEMBER_REMOVE: &str = "room.member.remove";

    pub const MESSAGE_SEND: &str = "message.send";
    pub const MESSAGE_EDIT: &str = "message.edit";
    pub const MESSAGE_DELETE: &str = "message.delete";
    pub const MESSAGE_READ: &str = "message.read";
    pub const MESSAGE_REACTION_ADD: &str = "message.reaction.add";
    pub const MESSAGE_REACTION_REMOVE: &str = "message.reaction.remove";

    pub const SYSTEM_MAINTENANCE: &str = "system.maintenance";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
    pub const SYSTEM_BROADCAST: &str = "system.broadcast";
}

/// Event levels.
pub mod levels {
    pub const USER: &str = "user";
    pub const ROOM: &str = "room";
    pub const MESSAGE: &str = "message";
    pub const SYSTEM: &str = "system";
}

/// A parsed `<level>.<action>` event type.
///
/// A leading `event.` segment is accepted and dropped, so
/// `event.user.typing.start` and `user.typing.start` are the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventType {
    level: String,
    action: String,
}

impl EventType {
    /// Parse a dotted event type.
    ///
    /// Returns `None` when there is no action segment.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.strip_prefix("event.").unwrap_or(raw);
        let mut parts = trimmed.split('.').filter(|p| !p.is_empty());
        let level = parts.next()?;
        let action = parts.collect::<Vec<_>>().join(".");
        if action.is_empty() {
            return None;
        }
        Some(Self {
            level: level.to_string(),
            action,
        })
    }

    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Normalized `<level>.<action>` key used for handler lookup.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.level, self.action)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.level, self.action)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Wire envelope of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
}

impl EventEnvelope {
    /// Create an envelope with a fresh id and the current time.
    #[must_use]
    pub fn new(event_type: &str, data: Map<String, Value>) -> Self {
        let (level, action) = match EventType::parse(event_type) {
            Some(parsed) => (parsed.level, parsed.action),
            None => ("unknown".to_string(), "unknown".to_string()),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            level,
            action,
            data,
            metadata: None,
            timestamp: Utc::now(),
            user_id: None,
            room_id: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_room(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// A user-level event.
    #[must_use]
    pub fn user_event(event_type: &str, user_id: Uuid, data: Map<String, Value>) -> Self {
        Self::new(event_type, data).with_user(user_id)
    }

    /// A room-level event.
    #[must_use]
    pub fn room_event(
        event_type: &str,
        room_id: Uuid,
        data: Map<String, Value>,
        user_id: Option<Uuid>,
    ) -> Self {
        let mut event = Self::new(event_type, data).with_room(room_id);
        event.user_id = user_id;
        event
    }

    /// A message-level event; `message_id` is added to the data.
    #[must_use]
    pub fn message_event(
        event_type: &str,
        room_id: Uuid,
        message_id: Uuid,
        mut data: Map<String, Value>,
        user_id: Option<Uuid>,
    ) -> Self {
        data.insert("message_id".into(), Value::String(message_id.to_string()));
        Self::room_event(event_type, room_id, data, user_id)
    }

    /// A typing indicator event.
    #[must_use]
    pub fn typing_event(room_id: Uuid, user_id: Uuid, is_typing: bool) -> Self {
        let event_type = if is_typing {
            types::USER_TYPING_START
        } else {
            types::USER_TYPING_STOP
        };
        let mut data = Map::new();
        data.insert("room_id".into(), Value::String(room_id.to_string()));
        data.insert("user_id".into(), Value::String(user_id.to_string()));
        data.insert("is_typing".into(), Value::Bool(is_typing));
        Self::new(event_type, data)
            .with_user(user_id)
            .with_room(room_id)
    }

    /// A presence (online/offline) event. Metadata is merged into the data.
    #[must_use]
    pub fn presence_event(user_id: Uuid, status: UserStatus, metadata: Map<String, Value>) -> Self {
        let event_type = if status == UserStatus::Offline {
            types::USER_OFFLINE
        } else {
            types::USER_ONLINE
        };
        let mut data = Map::new();
        data.insert("status".into(), Value::String(status.to_string()));
        for (k, v) in &metadata {
            data.insert(k.clone(), v.clone());
        }
        let mut event = Self::user_event(event_type, user_id, data);
        if !metadata.is_empty() {
            event.metadata = Some(metadata);
        }
        event
    }

    /// A system-wide event.
    #[must_use]
    pub fn system_event(event_type: &str, data: Map<String, Value>) -> Self {
        Self::new(event_type, data)
    }

    /// Decode an envelope from a bus payload.
    ///
    /// Some publishers double-encode the event as a JSON string; both forms
    /// are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if neither form parses.
    pub fn from_bus_payload(payload: &str) -> Result<Self, ProtocolError> {
        if let Ok(inner) = serde_json::from_str::<String>(payload) {
            return Ok(serde_json::from_str(&inner)?);
        }
        Ok(serde_json::from_str(payload)?)
    }

    /// Room id from the envelope, falling back to `data.room_id`.
    #[must_use]
    pub fn resolved_room_id(&self) -> Option<Uuid> {
        self.room_id.or_else(|| uuid_field(&self.data, "room_id"))
    }

    /// User id from the envelope, falling back to `data.user_id`.
    #[must_use]
    pub fn resolved_user_id(&self) -> Option<Uuid> {
        self.user_id.or_else(|| uuid_field(&self.data, "user_id"))
    }

    /// Event data as a JSON value.
    #[must_use]
    pub fn data_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

fn uuid_field(data: &Map<String, Value>, key: &str) -> Option<Uuid> {
    data.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Typed view of a domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    UserOnline { user_id: Uuid },
    UserOffline { user_id: Uuid },
    TypingStart { room_id: Uuid, user_id: Option<Uuid> },
    TypingStop { room_id: Uuid, user_id: Option<Uuid> },
    RoomCreate { room_id: Uuid, user_id: Option<Uuid> },
    RoomJoin { room_id: Uuid, user_id: Option<Uuid> },
    RoomLeave { room_id: Uuid, user_id: Option<Uuid> },
    MemberAdd { room_id: Uuid, user_id: Option<Uuid> },
    MemberRemove { room_id: Uuid, user_id: Option<Uuid> },
    MessageSend { room_id: Uuid },
    MessageEdit { room_id: Uuid },
    MessageDelete { room_id: Uuid },
    MessageRead { room_id: Uuid, user_id: Option<Uuid> },
    ReactionAdd { room_id: Uuid, user_id: Option<Uuid> },
    ReactionRemove { room_id: Uuid, user_id: Option<Uuid> },
    System { action: String },
    /// A well-formed type without a typed variant.
    Other,
}

/// A domain event with its typed kind resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub envelope: EventEnvelope,
    pub event_type: EventType,
    pub kind: EventKind,
}

impl DomainEvent {
    /// Lift an envelope into a typed event.
    ///
    /// # Errors
    ///
    /// Returns an error if the type string is not dotted, or if a field the
    /// variant requires (room or user id) is missing.
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self, ProtocolError> {
        let event_type = EventType::parse(&envelope.event_type)
            .ok_or_else(|| ProtocolError::InvalidEventType(envelope.event_type.clone()))?;
        let key = event_type.key();

        let room = || {
            envelope
                .resolved_room_id()
                .ok_or_else(|| ProtocolError::MissingField {
                    event_type: key.clone(),
                    field: "room_id",
                })
        };
        let user = || {
            envelope
                .resolved_user_id()
                .ok_or_else(|| ProtocolError::MissingField {
                    event_type: key.clone(),
                    field: "user_id",
                })
        };
        let user_id = envelope.resolved_user_id();

        let kind = match key.as_str() {
            types::USER_ONLINE => EventKind::UserOnline { user_id: user()? },
            types::USER_OFFLINE => EventKind::UserOffline { user_id: user()? },
            types::USER_TYPING_START => EventKind::TypingStart {
                room_id: room()?,
                user_id,
            },
            types::USER_TYPING_STOP => EventKind::TypingStop {
                room_id: room()?,
                user_id,
            },
            types::ROOM_CREATE => EventKind::RoomCreate {
                room_id: room()?,
                user_id,
            },
            types::ROOM_JOIN => EventKind::RoomJoin {
                room_id: room()?,
                user_id,
            },
            types::ROOM_LEAVE => EventKind::RoomLeave {
                room_id: room()?,
                user_id,
            },
            types::ROOM_MEMBER_ADD => EventKind::MemberAdd {
                room_id: room()?,
                user_id,
            },
            types::ROOM_MEMBER_REMOVE => EventKind::MemberRemove {
                room_id: room()?,
                user_id,
            },
            types::MESSAGE_SEND => EventKind::MessageSend { room_id: room()? },
            types::MESSAGE_EDIT => EventKind::MessageEdit { room_id: room()? },
            types::MESSAGE_DELETE => EventKind::MessageDelete { room_id: room()? },
            types::MESSAGE_READ => EventKind::MessageRead {
                room_id: room()?,
                user_id,
            },
            types::MESSAGE_REACTION_ADD => EventKind::ReactionAdd {
                room_id: room()?,
                user_id,
            },
            types::MESSAGE_REACTION_REMOVE => EventKind::ReactionRemove {
                room_id: room()?,
                user_id,
            },
            _ if event_type.level() == levels::SYSTEM => EventKind::System {
                action: event_type.action().to_string(),
            },
            _ => EventKind::Other,
        };

        Ok(Self {
            envelope,
            event_type,
            kind,
        })
    }

    /// Event id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.envelope.id
    }
}

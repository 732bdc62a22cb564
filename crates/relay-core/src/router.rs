//! Per-connection router for client-originated frames.
//!
//! Clients only send control frames. Chat messages go through the REST API
//! and come back as domain events, so the router never persists anything.

use crate::bridge::EventBridge;
use crate::connection::{ConnectionId, Identity, RoomId};
use crate::hub::HubError;
use relay_protocol::events::types;
use relay_protocol::{ClientFrame, EventEnvelope, FramePayload, StatusPayload, UserStatus};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What the router did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered on the same connection only.
    Replied,
    /// Published as a domain event and fanned out locally.
    Published,
    /// Recognised but unusable, e.g. typing without a room.
    Dropped,
    /// Unknown tag.
    Ignored,
}

/// Dispatches frames from one connection.
pub struct InboundRouter {
    connection_id: ConnectionId,
    identity: Identity,
    bridge: Arc<EventBridge>,
}

impl InboundRouter {
    pub fn new(connection_id: ConnectionId, identity: Identity, bridge: Arc<EventBridge>) -> Self {
        Self {
            connection_id,
            identity,
            bridge,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Handle one decoded client frame.
    ///
    /// Bus failures are logged and do not stop local fan-out.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn handle(&self, frame: ClientFrame) -> Result<Route, HubError> {
        trace!(connection = %self.connection_id, tag = %frame.tag(), "Client frame");
        match frame {
            ClientFrame::Ping => {
                self.bridge.hub().send_to(self.connection_id, FramePayload::Pong)?;
                Ok(Route::Replied)
            }
            ClientFrame::TypingStart { room_id } => self.typing(true, room_id).await,
            ClientFrame::TypingStop { room_id } => self.typing(false, room_id).await,
            ClientFrame::StatusChange { status } => self.status(status).await,
            ClientFrame::Unknown(tag) => {
                warn!(connection = %self.connection_id, tag = %tag, "Unknown client frame type");
                Ok(Route::Ignored)
            }
        }
    }

    async fn typing(&self, started: bool, room_id: Option<RoomId>) -> Result<Route, HubError> {
        let Some(room_id) = room_id else {
            debug!(connection = %self.connection_id, "Typing frame without room_id dropped");
            return Ok(Route::Dropped);
        };
        let user_id = self.identity.user_id;

        let mut event = EventEnvelope::typing_event(room_id, user_id, started);
        event.data.insert(
            "username".into(),
            Value::String(self.identity.username.clone()),
        );
        self.publish(&event).await;

        self.bridge.hub().broadcast_to_room(
            room_id,
            FramePayload::typing(started, room_id, user_id, Some(self.identity.username.clone())),
        )?;
        Ok(Route::Published)
    }

    async fn status(&self, status: Option<UserStatus>) -> Result<Route, HubError> {
        let Some(status) = status else {
            debug!(connection = %self.connection_id, "Status frame without valid status dropped");
            return Ok(Route::Dropped);
        };
        let user_id = self.identity.user_id;

        let mut data = Map::new();
        data.insert("status".into(), Value::String(status.to_string()));
        data.insert(
            "username".into(),
            Value::String(self.identity.username.clone()),
        );
        let event = EventEnvelope::user_event(types::USER_STATUS_CHANGE, user_id, data);
        self.publish(&event).await;

        self.bridge.hub().broadcast_to_connection_rooms(
            self.connection_id,
            FramePayload::UserStatusChange(StatusPayload {
                user_id,
                username: Some(self.identity.username.clone()),
                status,
                data: None,
            }),
        )?;
        Ok(Route::Published)
    }

    async fn publish(&self, event: &EventEnvelope) {
        if let Err(e) = self.bridge.publish_local(event).await {
            warn!(
                connection = %self.connection_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

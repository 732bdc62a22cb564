//! Event bridge: domain events in, hub broadcasts out.
//!
//! Each event type maps to a handler that decides which hub call to make and
//! which frame to send. Handlers only translate; they never touch membership
//! state except through the hub's own subscribe and unsubscribe commands.

use crate::bus::{self, BusError, EventPublisher, EventSource};
use crate::hub::{Hub, HubError};
use relay_protocol::events::types;
use relay_protocol::{
    DomainEvent, EventEnvelope, EventKind, EventType, FramePayload, MembershipPayload,
    ProtocolError, ReactionAction, ReactionPayload, StatusPayload, TypingPayload, UserStatus,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default number of recent event ids remembered for duplicate suppression.
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// Event types handled by [`EventBridge::with_default_handlers`].
pub const DEFAULT_EVENT_TYPES: &[&str] = &[
    types::USER_ONLINE,
    types::USER_OFFLINE,
    types::USER_TYPING_START,
    types::USER_TYPING_STOP,
    types::ROOM_CREATE,
    types::ROOM_JOIN,
    types::ROOM_LEAVE,
    types::ROOM_MEMBER_ADD,
    types::ROOM_MEMBER_REMOVE,
    types::MESSAGE_SEND,
    types::MESSAGE_EDIT,
    types::MESSAGE_DELETE,
    types::MESSAGE_READ,
    types::MESSAGE_REACTION_ADD,
    types::MESSAGE_REACTION_REMOVE,
    types::SYSTEM_MAINTENANCE,
    types::SYSTEM_SHUTDOWN,
    types::SYSTEM_BROADCAST,
];

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The event could not be decoded or lacks a required field.
    #[error("Invalid event: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A translation from one event type to hub calls.
pub type Handler = Box<dyn Fn(&Hub, &DomainEvent) -> Result<(), HubError> + Send + Sync>;

/// What happened to a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler is registered for the type.
    Unhandled,
    /// The id was seen recently.
    Duplicate,
}

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub handled: u64,
    pub unhandled: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub published: u64,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    unhandled: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
}

/// Bounded set of recently seen event ids, oldest evicted first.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Routes domain events to hub broadcasts.
pub struct EventBridge {
    hub: Hub,
    publisher: Arc<dyn EventPublisher>,
    handlers: HashMap<String, Handler>,
    recent: Mutex<RecentIds>,
    counters: Counters,
}

impl EventBridge {
    /// Create a bridge with no handlers.
    pub fn new(hub: Hub, publisher: Arc<dyn EventPublisher>, dedup_window: usize) -> Self {
        Self {
            hub,
            publisher,
            handlers: HashMap::new(),
            recent: Mutex::new(RecentIds::new(dedup_window)),
            counters: Counters::default(),
        }
    }

    /// Create a bridge with the standard event-to-frame mapping.
    pub fn with_default_handlers(
        hub: Hub,
        publisher: Arc<dyn EventPublisher>,
        dedup_window: usize,
    ) -> Self {
        let mut bridge = Self::new(hub, publisher, dedup_window);
        for event_type in DEFAULT_EVENT_TYPES {
            bridge.on(event_type, translate);
        }
        bridge
    }

    /// Register or replace the handler for an event type.
    ///
    /// The type is normalized, so `event.message.send` and `message.send`
    /// name the same handler.
    pub fn on<F>(&mut self, event_type: &str, handler: F)
    where
        F: Fn(&Hub, &DomainEvent) -> Result<(), HubError> + Send + Sync + 'static,
    {
        let key = EventType::parse(event_type).map_or_else(|| event_type.to_string(), |t| t.key());
        self.handlers.insert(key, Box::new(handler));
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Route one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is malformed, a field its handler needs
    /// is missing, or the hub has stopped. Unknown types are not errors.
    pub fn dispatch(&self, envelope: EventEnvelope) -> Result<Dispatch, BridgeError> {
        let result = self.dispatch_inner(envelope);
        let counter = match &result {
            Ok(Dispatch::Handled) => &self.counters.handled,
            Ok(Dispatch::Unhandled) => &self.counters.unhandled,
            Ok(Dispatch::Duplicate) => &self.counters.duplicates,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn dispatch_inner(&self, envelope: EventEnvelope) -> Result<Dispatch, BridgeError> {
        let event_type = EventType::parse(&envelope.event_type)
            .ok_or_else(|| ProtocolError::InvalidEventType(envelope.event_type.clone()))?;
        let key = event_type.key();

        let Some(handler) = self.handlers.get(&key) else {
            debug!(event_type = %key, event_id = %envelope.id, "No handler for event type");
            return Ok(Dispatch::Unhandled);
        };

        if !self.remember(&envelope.id) {
            trace!(event_type = %key, event_id = %envelope.id, "Duplicate event ignored");
            return Ok(Dispatch::Duplicate);
        }

        let event = DomainEvent::from_envelope(envelope)?;
        handler(&self.hub, &event)?;
        debug!(event_type = %key, event_id = %event.id(), "Event dispatched");
        Ok(Dispatch::Handled)
    }

    /// Decode a raw bus payload and route it.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch), plus decode failures.
    pub fn dispatch_payload(&self, payload: &str) -> Result<Dispatch, BridgeError> {
        match EventEnvelope::from_bus_payload(payload) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Publish an event that originated in this process.
    ///
    /// Its id is recorded first, so when the bus echoes it back the bridge
    /// skips it; local peers have already been served directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus rejects the publish.
    pub async fn publish_local(&self, event: &EventEnvelope) -> Result<(), BridgeError> {
        self.remember(&event.id);
        bus::publish_event(self.publisher.as_ref(), event).await?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remember(&self, id: &str) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            handled: self.counters.handled.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
        }
    }

    /// Consume a bus source until it ends or the hub stops.
    ///
    /// Bad events are logged and skipped.
    pub async fn run<S: EventSource>(self: Arc<Self>, mut source: S) {
        info!(handlers = self.handlers.len(), "Event bridge started");

        while let Some(message) = source.next_message().await {
            match self.dispatch_payload(&message.payload) {
                Ok(_) => {}
                Err(BridgeError::Hub(HubError::Closed)) => {
                    info!("Hub stopped, event bridge exiting");
                    return;
                }
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "Failed to handle event");
                }
            }
        }

        info!("Event bus closed, event bridge exiting");
    }
}

fn username(event: &DomainEvent) -> Option<String> {
    event
        .envelope
        .data
        .get("username")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn status_frame(event: &DomainEvent, user_id: Uuid, status: UserStatus) -> FramePayload {
    FramePayload::UserStatusChange(StatusPayload {
        user_id,
        username: username(event),
        status,
        data: Some(event.envelope.data_value()),
    })
}

fn membership(event: &DomainEvent, room_id: Uuid, user_id: Option<Uuid>) -> MembershipPayload {
    MembershipPayload {
        room_id,
        user_id,
        username: username(event),
        data: Some(event.envelope.data_value()),
    }
}

fn reaction(event: &DomainEvent, action: ReactionAction, room_id: Uuid, user_id: Option<Uuid>) -> FramePayload {
    FramePayload::MessageReaction(ReactionPayload {
        action,
        room_id,
        user_id,
        data: event.envelope.data_value(),
    })
}

fn notify(event: &DomainEvent, kind: &str, room_id: Uuid, user_id: Option<Uuid>) -> FramePayload {
    FramePayload::notification(kind, Some(room_id), user_id, Some(event.envelope.data_value()))
}

/// The standard mapping from event kinds to hub calls.
fn translate(hub: &Hub, event: &DomainEvent) -> Result<(), HubError> {
    match &event.kind {
        EventKind::UserOnline { user_id } => {
            hub.broadcast_to_user(*user_id, status_frame(event, *user_id, UserStatus::Online))
        }
        EventKind::UserOffline { user_id } => {
            hub.broadcast_to_user(*user_id, status_frame(event, *user_id, UserStatus::Offline))
        }
        EventKind::TypingStart { room_id, user_id } | EventKind::TypingStop { room_id, user_id } => {
            let body = TypingPayload {
                room_id: *room_id,
                user_id: *user_id,
                username: username(event),
            };
            let payload = if matches!(event.kind, EventKind::TypingStart { .. }) {
                FramePayload::TypingStart(body)
            } else {
                FramePayload::TypingStop(body)
            };
            hub.broadcast_to_room(*room_id, payload)
        }
        EventKind::RoomCreate { room_id, user_id } => {
            hub.broadcast_to_room(*room_id, notify(event, "room_created", *room_id, *user_id))
        }
        EventKind::RoomJoin { room_id, user_id } => {
            if let Some(user_id) = user_id {
                hub.subscribe(*user_id, *room_id)?;
            }
            hub.broadcast_to_room(
                *room_id,
                FramePayload::UserJoin(membership(event, *room_id, *user_id)),
            )
        }
        EventKind::RoomLeave { room_id, user_id } => {
            hub.broadcast_to_room(
                *room_id,
                FramePayload::UserLeave(membership(event, *room_id, *user_id)),
            )?;
            match user_id {
                Some(user_id) => hub.unsubscribe(*user_id, *room_id),
                None => Ok(()),
            }
        }
        EventKind::MemberAdd { room_id, user_id } => {
            if let Some(user_id) = user_id {
                hub.subscribe(*user_id, *room_id)?;
            }
            hub.broadcast_to_room(*room_id, notify(event, "member_added", *room_id, *user_id))
        }
        EventKind::MemberRemove { room_id, user_id } => {
            hub.broadcast_to_room(*room_id, notify(event, "member_removed", *room_id, *user_id))?;
            match user_id {
                Some(user_id) => hub.unsubscribe(*user_id, *room_id),
                None => Ok(()),
            }
        }
        EventKind::MessageSend { room_id } => {
            hub.broadcast_to_room(*room_id, FramePayload::Message(event.envelope.data_value()))
        }
        EventKind::MessageEdit { room_id } => {
            hub.broadcast_to_room(*room_id, FramePayload::MessageEdit(event.envelope.data_value()))
        }
        EventKind::MessageDelete { room_id } => hub.broadcast_to_room(
            *room_id,
            FramePayload::MessageDelete(event.envelope.data_value()),
        ),
        EventKind::MessageRead { room_id, user_id } => {
            hub.broadcast_to_room(*room_id, notify(event, "message_read", *room_id, *user_id))
        }
        EventKind::ReactionAdd { room_id, user_id } => {
            hub.broadcast_to_room(*room_id, reaction(event, ReactionAction::Add, *room_id, *user_id))
        }
        EventKind::ReactionRemove { room_id, user_id } => hub.broadcast_to_room(
            *room_id,
            reaction(event, ReactionAction::Remove, *room_id, *user_id),
        ),
        EventKind::System { action } => match action.as_str() {
            "broadcast" => hub.broadcast_all(FramePayload::notification(
                "system_broadcast",
                None,
                None,
                Some(event.envelope.data_value()),
            )),
            "shutdown" => {
                warn!(event_id = %event.id(), "System shutdown announced");
                Ok(())
            }
            _ => {
                info!(action = %action, event_id = %event.id(), "System event");
                Ok(())
            }
        },
        EventKind::Other => {
            debug!(event_type = %event.event_type, "No default translation");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{channels, MemoryBus};
    use crate::hub::HubConfig;
    use crate::testutil::{connect, drain, types};
    use serde_json::{json, Map, Value};

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn bridge(hub: &Hub, window: usize) -> EventBridge {
        EventBridge::with_default_handlers(hub.clone(), Arc::new(MemoryBus::new()), window)
    }

    #[tokio::test]
    async fn test_typing_event_reaches_room() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);
        let (u1, u2, room) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (_c1, mut rx1) = connect(&hub, u1, 8);
        let (_c2, mut rx2) = connect(&hub, u2, 8);
        hub.subscribe(u1, room).unwrap();
        hub.subscribe(u2, room).unwrap();

        let mut event = EventEnvelope::typing_event(room, u1, true);
        event.event_type = format!("event.{}", event.event_type);
        assert_eq!(bridge.dispatch(event).unwrap(), Dispatch::Handled);
        hub.stats().await.unwrap();

        let frames = drain(&mut rx2);
        assert_eq!(types(&frames), vec!["auth", "typing_start"]);
        assert_eq!(frames[1]["data"]["user_id"], u1.to_string());
        assert_eq!(types(&drain(&mut rx1)), vec!["auth", "typing_start"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_ignored() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);
        let (user, room) = (Uuid::new_v4(), Uuid::new_v4());
        let (_c, mut rx) = connect(&hub, user, 8);
        hub.subscribe(user, room).unwrap();

        let event = EventEnvelope::room_event(
            types::MESSAGE_SEND,
            room,
            data(json!({"text": "hi"})),
            Some(user),
        );
        assert_eq!(bridge.dispatch(event.clone()).unwrap(), Dispatch::Handled);
        assert_eq!(bridge.dispatch(event).unwrap(), Dispatch::Duplicate);
        hub.stats().await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["auth", "message"]);
        assert_eq!(frames[1]["data"]["text"], "hi");
        assert_eq!(bridge.stats().duplicates, 1);
    }

    #[test]
    fn test_recent_ids_window_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"));

        let mut disabled = RecentIds::new(0);
        assert!(disabled.insert("a"));
        assert!(disabled.insert("a"));
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_events() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);

        let unknown = EventEnvelope::new("user.profile.update", Map::new());
        assert_eq!(bridge.dispatch(unknown).unwrap(), Dispatch::Unhandled);

        // Status changes are fanned out by the gateway that received them.
        let status = EventEnvelope::user_event(
            types::USER_STATUS_CHANGE,
            Uuid::new_v4(),
            data(json!({"status": "away"})),
        );
        assert_eq!(bridge.dispatch(status).unwrap(), Dispatch::Unhandled);

        let missing_room = EventEnvelope::new(types::MESSAGE_SEND, Map::new());
        assert!(matches!(
            bridge.dispatch(missing_room),
            Err(BridgeError::Protocol(ProtocolError::MissingField { field: "room_id", .. }))
        ));

        assert!(bridge.dispatch_payload("not json").is_err());

        let stats = bridge.stats();
        assert_eq!(stats.unhandled, 2);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_room_join_subscribes_and_announces() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);
        let (joiner, member, room) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (c_joiner, mut rx_joiner) = connect(&hub, joiner, 8);
        let (_c_member, mut rx_member) = connect(&hub, member, 8);
        hub.subscribe(member, room).unwrap();

        let event = EventEnvelope::room_event(
            types::ROOM_JOIN,
            room,
            data(json!({"username": "dana"})),
            Some(joiner),
        );
        bridge.dispatch(event).unwrap();

        assert!(hub.room_connections(room).await.unwrap().contains(&c_joiner));
        let frames = drain(&mut rx_member);
        assert_eq!(types(&frames), vec!["auth", "user_join"]);
        assert_eq!(frames[1]["data"]["username"], "dana");
        assert_eq!(types(&drain(&mut rx_joiner)), vec!["auth", "user_join"]);

        let leave = EventEnvelope::room_event(types::ROOM_LEAVE, room, Map::new(), Some(joiner));
        bridge.dispatch(leave).unwrap();
        assert!(!hub.room_connections(room).await.unwrap().contains(&c_joiner));
        assert_eq!(types(&drain(&mut rx_joiner)), vec!["user_leave"]);
    }

    #[tokio::test]
    async fn test_reaction_and_read_frames() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);
        let (user, room) = (Uuid::new_v4(), Uuid::new_v4());
        let (_c, mut rx) = connect(&hub, user, 8);
        hub.subscribe(user, room).unwrap();

        let add = EventEnvelope::message_event(
            types::MESSAGE_REACTION_ADD,
            room,
            Uuid::new_v4(),
            data(json!({"emoji": "👍"})),
            Some(user),
        );
        bridge.dispatch(add).unwrap();
        let read = EventEnvelope::room_event(types::MESSAGE_READ, room, Map::new(), Some(user));
        bridge.dispatch(read).unwrap();
        hub.stats().await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["auth", "message_reaction", "notification"]);
        assert_eq!(frames[1]["data"]["action"], "add");
        assert_eq!(frames[1]["data"]["data"]["emoji"], "👍");
        assert_eq!(frames[2]["data"]["type"], "message_read");
    }

    #[tokio::test]
    async fn test_system_broadcast_reaches_everyone() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bridge = bridge(&hub, DEFAULT_DEDUP_WINDOW);
        let (_a, mut rx_a) = connect(&hub, Uuid::new_v4(), 8);
        let (_b, mut rx_b) = connect(&hub, Uuid::new_v4(), 8);

        let event = EventEnvelope::system_event(
            types::SYSTEM_BROADCAST,
            data(json!({"message": "maintenance at noon"})),
        );
        bridge.dispatch(event).unwrap();
        let maintenance = EventEnvelope::system_event(types::SYSTEM_MAINTENANCE, Map::new());
        assert_eq!(bridge.dispatch(maintenance).unwrap(), Dispatch::Handled);
        hub.stats().await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain(rx);
            assert_eq!(types(&frames), vec!["auth", "notification"]);
            assert_eq!(frames[1]["data"]["type"], "system_broadcast");
        }
    }

    #[tokio::test]
    async fn test_local_publish_echo_is_skipped() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let bus = MemoryBus::new();
        let bridge = Arc::new(EventBridge::with_default_handlers(
            hub.clone(),
            Arc::new(bus.clone()),
            DEFAULT_DEDUP_WINDOW,
        ));
        let subscription = bus.subscribe(channels::DEFAULT_SUBSCRIPTIONS.iter().copied());
        tokio::spawn(Arc::clone(&bridge).run(subscription));

        let (user, room) = (Uuid::new_v4(), Uuid::new_v4());
        let (_c, mut rx) = connect(&hub, user, 8);
        hub.subscribe(user, room).unwrap();

        bridge
            .publish_local(&EventEnvelope::typing_event(room, user, true))
            .await
            .unwrap();
        let remote = EventEnvelope::room_event(types::MESSAGE_SEND, room, Map::new(), Some(user));
        publish_remote(&bus, &remote).await;

        // The remote message arrives after the echo, so once it is queued
        // the echo has been processed too.
        let auth = rx.recv().await.unwrap();
        let next = rx.recv().await.unwrap();
        let auth: Value = serde_json::from_slice(&auth).unwrap();
        let next: Value = serde_json::from_slice(&next).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(next["type"], "message");
        assert!(rx.try_recv().is_err());

        let stats = bridge.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.handled, 1);
    }

    async fn publish_remote(bus: &MemoryBus, event: &EventEnvelope) {
        bus::publish_event(bus, event).await.unwrap();
    }
}

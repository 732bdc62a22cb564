//! Event bus port.
//!
//! Domain events travel between processes over named channels. The gateway
//! only needs two capabilities from a bus: publish an envelope on a channel,
//! and receive messages from channels matching a set of patterns. Patterns
//! ending in `*` match by prefix, so `room:*` covers every room channel.

use crate::connection::{RoomId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use relay_protocol::events::{levels, types};
use relay_protocol::{EventEnvelope, EventType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The event could not be serialized.
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// The bus backend rejected or lost the publish.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Channel naming.
pub mod channels {
    use super::*;

    pub const PRESENCE: &str = "presence";
    pub const SYSTEM: &str = "system";
    pub const GLOBAL: &str = "global";

    /// Patterns the gateway listens on unless configured otherwise.
    pub const DEFAULT_SUBSCRIPTIONS: &[&str] = &["room:*", PRESENCE, SYSTEM, GLOBAL];

    #[must_use]
    pub fn user(user_id: UserId) -> String {
        format!("user:{user_id}")
    }

    #[must_use]
    pub fn room(room_id: RoomId) -> String {
        format!("room:{room_id}")
    }

    /// Whether `channel` is covered by `pattern`.
    #[must_use]
    pub fn matches(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }

    /// Channels an event is published on.
    ///
    /// Typing goes to the user and the room, presence to the user and the
    /// presence channel, other user events to the user, room and message
    /// events to the room, and system events to the system channel. Events
    /// that resolve to nothing go to the global channel.
    #[must_use]
    pub fn for_event(event: &EventEnvelope) -> Vec<String> {
        let user_id = event.resolved_user_id();
        let room_id = event.resolved_room_id();
        let mut out = Vec::with_capacity(2);

        match EventType::parse(&event.event_type) {
            Some(t) if t.level() == levels::USER => {
                let key = t.key();
                out.extend(user_id.map(user));
                if key == types::USER_TYPING_START || key == types::USER_TYPING_STOP {
                    out.extend(room_id.map(room));
                } else if key == types::USER_ONLINE
                    || key == types::USER_OFFLINE
                    || key == types::USER_STATUS_CHANGE
                {
                    out.push(PRESENCE.to_string());
                }
            }
            Some(t) if t.level() == levels::ROOM || t.level() == levels::MESSAGE => {
                out.extend(room_id.map(room));
            }
            Some(t) if t.level() == levels::SYSTEM => out.push(SYSTEM.to_string()),
            _ => {}
        }

        if out.is_empty() {
            out.push(GLOBAL.to_string());
        }
        out
    }
}

/// A raw message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Publishing side of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on one channel.
    async fn publish(&self, channel: &str, event: &EventEnvelope) -> Result<(), BusError>;
}

/// Receiving side of the bus.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next message. `None` once the source is exhausted.
    async fn next_message(&mut self) -> Option<BusMessage>;
}

/// Publish an event on every channel it belongs to.
///
/// # Errors
///
/// Returns the first publish error. Channels after the failing one are not
/// attempted.
pub async fn publish_event(
    publisher: &dyn EventPublisher,
    event: &EventEnvelope,
) -> Result<(), BusError> {
    for channel in channels::for_event(event) {
        publisher.publish(&channel, event).await?;
    }
    Ok(())
}

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct BusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// In-process bus.
///
/// Used when the gateway runs on its own and in tests. Each subscription has
/// its own queue, so a slow subscriber never makes another one miss messages.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive messages on channels matching any of `patterns`.
    pub fn subscribe<I, S>(&self, patterns: I) -> BusSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscription = id, ?patterns, "Bus subscription created");
        self.inner.subscribers.insert(id, Subscriber { patterns, tx });
        BusSubscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Publish an already-encoded payload. Returns how many subscriptions
    /// received it.
    pub fn publish_raw(&self, channel: &str, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.patterns.iter().any(|p| channels::matches(p, channel)) {
                continue;
            }
            let message = BusMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if entry.tx.send(message).is_ok() {
                delivered += 1;
            } else {
                dead.push(*entry.key());
            }
        }

        for id in dead {
            self.inner.subscribers.remove(&id);
        }
        trace!(channel = %channel, delivered, "Bus publish");
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, channel: &str, event: &EventEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        self.publish_raw(channel, payload);
        Ok(())
    }
}

/// A live subscription on a [`MemoryBus`]. Dropping it unsubscribes.
pub struct BusSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    inner: Arc<BusInner>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// A message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.inner.subscribers.remove(&self.id);
    }
}

#[async_trait]
impl EventSource for BusSubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        self.recv().await
    }
}

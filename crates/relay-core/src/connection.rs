//! Connection identity and the outbound queue handle the hub holds.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of an application user.
pub type UserId = Uuid;

/// Identifier of a chat room.
pub type RoomId = Uuid;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a single socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who is on the other end of a socket, as established at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub device_id: String,
}

impl Identity {
    pub fn new(user_id: UserId, username: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            device_id: device_id.into(),
        }
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is at capacity; the consumer is too slow.
    #[error("Outbound queue is full")]
    Full,

    /// The writer side has gone away.
    #[error("Outbound queue is closed")]
    Closed,
}

/// Producer side of a connection's bounded outbound queue.
///
/// Pushing never waits. Encoded frames are shared, so cloning a frame into
/// many queues only bumps a reference count.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
}

impl OutboundQueue {
    /// Create a queue and the receiver its writer drains.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue an encoded frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Full` when the queue is at capacity and `Closed` when the
    /// writer has exited.
    pub fn try_push(&self, frame: Bytes) -> Result<(), QueueError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything the hub needs to address one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    pub queue: OutboundQueue,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id and a queue of `capacity` frames.
    #[must_use]
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (queue, rx) = OutboundQueue::bounded(capacity);
        let handle = Self {
            id: ConnectionId::generate(),
            identity,
            queue,
        };
        (handle, rx)
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }
}

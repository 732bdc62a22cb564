//! Fixtures shared by the relay benchmarks.

use bytes::Bytes;
use relay_core::{ConnectionHandle, Hub, HubError, Identity, RoomId};
use relay_protocol::FramePayload;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Register `count` single-device users and put them all in `room`.
///
/// Commands are queued in order, so every subscribe lands after its
/// registration. Await `hub.stats()` before measuring.
///
/// # Errors
///
/// Returns `Closed` if the hub has stopped.
pub fn join_room(
    hub: &Hub,
    room: RoomId,
    count: usize,
    capacity: usize,
) -> Result<Vec<mpsc::Receiver<Bytes>>, HubError> {
    (0..count)
        .map(|i| {
            let user = Uuid::new_v4();
            let identity = Identity::new(user, format!("bench-{i}"), "bench");
            let (handle, rx) = ConnectionHandle::new(identity, capacity);
            hub.register(handle)?;
            hub.subscribe(user, room)?;
            Ok(rx)
        })
        .collect()
}

/// Empty every queue without blocking. Returns the number of frames taken.
pub fn drain(receivers: &mut [mpsc::Receiver<Bytes>]) -> usize {
    let mut taken = 0;
    for rx in receivers {
        while rx.try_recv().is_ok() {
            taken += 1;
        }
    }
    taken
}

/// A chat message of roughly `content_len` bytes.
#[must_use]
pub fn chat_message(room: RoomId, content_len: usize) -> FramePayload {
    FramePayload::Message(json!({
        "message_id": Uuid::new_v4(),
        "room_id": room,
        "content": "x".repeat(content_len),
    }))
}

//! Helpers shared by unit tests.

use crate::connection::{ConnectionHandle, ConnectionId, Identity, UserId};
use crate::hub::Hub;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

/// Register a connection for `user_id` and return its id and queue.
pub(crate) fn connect(
    hub: &Hub,
    user_id: UserId,
    capacity: usize,
) -> (ConnectionId, mpsc::Receiver<Bytes>) {
    let identity = Identity::new(user_id, format!("user-{}", user_id.as_u128()), "web");
    let (handle, rx) = ConnectionHandle::new(identity, capacity);
    let id = handle.id;
    hub.register(handle).unwrap();
    (id, rx)
}

/// Everything currently queued, decoded.
pub(crate) fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        frames.push(serde_json::from_slice(&bytes).unwrap());
    }
    frames
}

pub(crate) fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

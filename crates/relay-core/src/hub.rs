//! The hub: single owner of connection and room state.
//!
//! All membership mutation and fan-out run on one control task that drains a
//! command queue. Callers hold a cheap [`Hub`] handle and never touch the
//! index directly, so there are no locks and broadcasts always see a
//! consistent snapshot.
//!
//! Delivery is a non-blocking push into each target's bounded outbound queue.
//! A full or closed queue gets its connection evicted within the same control
//! step, which in turn emits `user_leave` for any room the user vacated.

use crate::connection::{ConnectionHandle, ConnectionId, QueueError, RoomId, UserId};
use crate::membership::MembershipIndex;
use bytes::Bytes;
use relay_protocol::{codec, AuthAck, FramePayload, OutboundFrame};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The control task has exited.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Registrations beyond this many live connections are refused.
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub users: usize,
    pub subscriptions: usize,
    /// Frames pushed into outbound queues since start.
    pub frames_sent: u64,
    /// Connections dropped because their queue was full or closed.
    pub evictions: u64,
    /// Registrations refused by the connection limit.
    pub rejected: u64,
}

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Room(RoomId),
    User(UserId),
    Connection(ConnectionId),
    /// Every connection sharing at least one room with the given one.
    ConnectionRooms(ConnectionId),
    All,
}

enum Command {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Subscribe {
        user_id: UserId,
        room_id: RoomId,
    },
    Unsubscribe {
        user_id: UserId,
        room_id: RoomId,
    },
    Broadcast {
        target: Target,
        payload: FramePayload,
        reply: Option<oneshot::Sender<usize>>,
    },
    Stats(oneshot::Sender<HubStats>),
    RoomConnections {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Shutdown,
}

/// Handle to the hub's control task.
///
/// Cloning is cheap. Fire-and-forget operations enqueue a command and
/// return immediately; they only fail once the hub has stopped.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register(handle) => write!(f, "Register({})", handle.id),
            Command::Unregister(id) => write!(f, "Unregister({id})"),
            Command::Subscribe { user_id, room_id } => write!(f, "Subscribe({user_id}, {room_id})"),
            Command::Unsubscribe { user_id, room_id } => {
                write!(f, "Unsubscribe({user_id}, {room_id})")
            }
            Command::Broadcast {
                target, payload, ..
            } => write!(f, "Broadcast({target:?}, {})", payload.frame_type()),
            Command::Stats(_) => f.write_str("Stats"),
            Command::RoomConnections { room_id, .. } => write!(f, "RoomConnections({room_id})"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl Hub {
    /// Start the control task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = HubCore::new(config);
        let task = tokio::spawn(core.run(rx));
        (Self { commands: tx }, task)
    }

    fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Closed)
    }

    /// Admit a connection. It receives an `auth` acknowledgement and joins
    /// every room its user is already in.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(Command::Register(handle))
    }

    /// Remove a connection. Unknown or already removed ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id))
    }

    /// Join every live connection of a user to a room.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn subscribe(&self, user_id: UserId, room_id: RoomId) -> Result<(), HubError> {
        self.send(Command::Subscribe { user_id, room_id })
    }

    /// Remove every live connection of a user from a room.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn unsubscribe(&self, user_id: UserId, room_id: RoomId) -> Result<(), HubError> {
        self.send(Command::Unsubscribe { user_id, room_id })
    }

    /// Queue a frame for `target` without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn broadcast(&self, target: Target, payload: FramePayload) -> Result<(), HubError> {
        self.send(Command::Broadcast {
            target,
            payload,
            reply: None,
        })
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn broadcast_to_room(&self, room_id: RoomId, payload: FramePayload) -> Result<(), HubError> {
        self.broadcast(Target::Room(room_id), payload)
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn broadcast_to_user(&self, user_id: UserId, payload: FramePayload) -> Result<(), HubError> {
        self.broadcast(Target::User(user_id), payload)
    }

    /// Fan out to everyone sharing a room with `id`. Each recipient gets the
    /// frame once even when several rooms are shared.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn broadcast_to_connection_rooms(
        &self,
        id: ConnectionId,
        payload: FramePayload,
    ) -> Result<(), HubError> {
        self.broadcast(Target::ConnectionRooms(id), payload)
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn broadcast_all(&self, payload: FramePayload) -> Result<(), HubError> {
        self.broadcast(Target::All, payload)
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub fn send_to(&self, id: ConnectionId, payload: FramePayload) -> Result<(), HubError> {
        self.broadcast(Target::Connection(id), payload)
    }

    /// Broadcast and wait for the number of queues the frame reached.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn publish(&self, target: Target, payload: FramePayload) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Broadcast {
            target,
            payload,
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn publish_to_room(
        &self,
        room_id: RoomId,
        payload: FramePayload,
    ) -> Result<usize, HubError> {
        self.publish(Target::Room(room_id), payload).await
    }

    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn publish_to_user(
        &self,
        user_id: UserId,
        payload: FramePayload,
    ) -> Result<usize, HubError> {
        self.publish(Target::User(user_id), payload).await
    }

    /// Current statistics. Also acts as a barrier: every command sent before
    /// this call has been applied when it returns.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Connections currently subscribed to a room.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the hub has stopped.
    pub async fn room_connections(&self, room_id: RoomId) -> Result<Vec<ConnectionId>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RoomConnections { room_id, reply: tx })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the control task. Every outbound queue is closed, which makes
    /// each connection's writer send a close frame and exit.
    pub fn shutdown(&self) {
        if self.send(Command::Shutdown).is_err() {
            debug!("Hub already stopped");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

struct HubCore {
    index: MembershipIndex<ConnectionHandle>,
    config: HubConfig,
    frames_sent: u64,
    evictions: u64,
    rejected: u64,
}

impl HubCore {
    fn new(config: HubConfig) -> Self {
        Self {
            index: MembershipIndex::new(),
            config,
            frames_sent: 0,
            evictions: 0,
            rejected: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(max_connections = self.config.max_connections, "Hub started");

        while let Some(command) = commands.recv().await {
            trace!(?command, "Hub command");
            if !self.apply(command) {
                break;
            }

            #[cfg(test)]
            if let Err(problem) = self.index.check_consistency() {
                panic!("membership index inconsistent: {problem}");
            }
        }

        let open = self.index.drain().count();
        info!(closed_connections = open, "Hub stopped");
    }

    /// Apply one command. Returns `false` when the hub should stop.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Register(handle) => self.register(handle),
            Command::Unregister(id) => {
                if !self.index.contains(id) {
                    debug!(connection = %id, "Unregister for unknown connection");
                }
                self.disconnect(vec![id]);
            }
            Command::Subscribe { user_id, room_id } => {
                if self.index.join_user(user_id, room_id) {
                    debug!(user_id = %user_id, room_id = %room_id, "User joined room");
                } else {
                    debug!(
                        user_id = %user_id,
                        room_id = %room_id,
                        "Subscribe ignored, user offline or already in room"
                    );
                }
            }
            Command::Unsubscribe { user_id, room_id } => {
                if self.index.leave_user(user_id, room_id) {
                    debug!(user_id = %user_id, room_id = %room_id, "User left room");
                }
            }
            Command::Broadcast {
                target,
                payload,
                reply,
            } => {
                let delivered = self.broadcast(target, payload);
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::RoomConnections { room_id, reply } => {
                let _ = reply.send(self.index.room_members(room_id).collect());
            }
            Command::Shutdown => {
                info!("Hub shutting down");
                return false;
            }
        }
        true
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let id = handle.id;
        if self.index.contains(id) {
            warn!(connection = %id, "Connection already registered");
            return;
        }
        if self.index.len() >= self.config.max_connections {
            self.rejected += 1;
            warn!(
                connection = %id,
                max_connections = self.config.max_connections,
                "Connection limit reached, rejecting"
            );
            return;
        }

        let user_id = handle.user_id();
        let ack = encode(FramePayload::Auth(AuthAck::connected(
            user_id,
            handle.identity.device_id.clone(),
        )));
        info!(
            connection = %id,
            user_id = %user_id,
            device_id = %handle.identity.device_id,
            "Client connected"
        );
        self.index.insert(id, user_id, handle);

        if let Some(ack) = ack {
            self.deliver(vec![id], &ack);
        }
    }

    fn broadcast(&mut self, target: Target, payload: FramePayload) -> usize {
        let targets = self.resolve(target);
        if targets.is_empty() {
            trace!(?target, "Broadcast has no recipients");
            return 0;
        }
        let frame_type = payload.frame_type();
        let Some(frame) = encode(payload) else {
            return 0;
        };
        let delivered = self.deliver(targets, &frame);
        trace!(?target, frame_type = %frame_type, delivered, "Broadcast");
        delivered
    }

    fn resolve(&self, target: Target) -> Vec<ConnectionId> {
        match target {
            Target::Room(room_id) => self.index.room_members(room_id).collect(),
            Target::User(user_id) => self.index.user_connections(user_id).collect(),
            Target::Connection(id) => {
                if self.index.contains(id) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            Target::ConnectionRooms(id) => {
                let mut seen = HashSet::new();
                if let Some(rooms) = self.index.connection_rooms(id) {
                    for room_id in rooms {
                        seen.extend(self.index.room_members(*room_id));
                    }
                }
                seen.into_iter().collect()
            }
            Target::All => self.index.iter().map(|(id, _)| id).collect(),
        }
    }

    /// Push a frame to each target, then evict whoever could not take it.
    fn deliver(&mut self, targets: Vec<ConnectionId>, frame: &Bytes) -> usize {
        let mut failed = Vec::new();
        let delivered = self.push(&targets, frame, &mut failed);
        if !failed.is_empty() {
            self.disconnect(failed);
        }
        delivered
    }

    fn push(&mut self, targets: &[ConnectionId], frame: &Bytes, failed: &mut Vec<ConnectionId>) -> usize {
        let mut delivered = 0;
        for id in targets {
            let Some(member) = self.index.get(*id) else {
                continue;
            };
            match member.handle.queue.try_push(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(QueueError::Full) => {
                    warn!(
                        connection = %id,
                        user_id = %member.user_id,
                        "Outbound queue full, evicting slow consumer"
                    );
                    self.evictions += 1;
                    failed.push(*id);
                }
                Err(QueueError::Closed) => {
                    debug!(connection = %id, "Outbound queue closed, evicting");
                    self.evictions += 1;
                    failed.push(*id);
                }
            }
        }
        self.frames_sent += delivered as u64;
        delivered
    }

    /// Remove connections, notifying rooms their users have left. Evictions
    /// caused by those notifications are handled in the same pass.
    fn disconnect(&mut self, ids: Vec<ConnectionId>) {
        let mut pending: VecDeque<ConnectionId> = ids.into();

        while let Some(id) = pending.pop_front() {
            let Some(removed) = self.index.remove(id) else {
                continue;
            };
            info!(
                connection = %id,
                user_id = %removed.user_id,
                device_id = %removed.handle.identity.device_id,
                "Client disconnected"
            );

            for room_id in removed.vacated {
                let targets: Vec<ConnectionId> = self.index.room_members(room_id).collect();
                if targets.is_empty() {
                    continue;
                }
                let leave = FramePayload::user_leave(
                    room_id,
                    removed.user_id,
                    Some(removed.handle.identity.username.clone()),
                );
                if let Some(frame) = encode(leave) {
                    let mut failed = Vec::new();
                    self.push(&targets, &frame, &mut failed);
                    pending.extend(failed);
                }
            }
        }
    }

    fn stats(&self) -> HubStats {
        let index = self.index.stats();
        HubStats {
            connections: index.connections,
            rooms: index.rooms,
            users: index.users,
            subscriptions: index.subscriptions,
            frames_sent: self.frames_sent,
            evictions: self.evictions,
            rejected: self.rejected,
        }
    }
}

fn encode(payload: FramePayload) -> Option<Bytes> {
    let frame_type = payload.frame_type();
    match codec::encode(&OutboundFrame::new(payload)) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(frame_type = %frame_type, error = %e, "Failed to encode frame");
            None
        }
    }
}

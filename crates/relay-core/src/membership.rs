//! Room membership bookkeeping.
//!
//! Membership is tracked per user: `user_rooms[u]` is the set of rooms user
//! `u` belongs to, and every live connection of `u` is subscribed to exactly
//! that set. A second device inherits the rooms of the first, and a user only
//! leaves a room when their last connection goes away.
//!
//! The index is a plain single-owner structure. The hub's control task owns
//! it, so there is no interior locking here.

use crate::connection::{ConnectionId, RoomId, UserId};
use std::collections::{HashMap, HashSet};

/// A registered connection and the rooms it is subscribed to.
#[derive(Debug)]
pub struct Member<T> {
    pub user_id: UserId,
    pub rooms: HashSet<RoomId>,
    pub handle: T,
}

/// Result of removing a connection from the index.
#[derive(Debug)]
pub struct Removed<T> {
    pub handle: T,
    pub user_id: UserId,
    /// Whether this was the user's last live connection.
    pub last_connection: bool,
    /// Rooms the user no longer has any presence in, sorted.
    pub vacated: Vec<RoomId>,
}

/// Snapshot of index sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub connections: usize,
    pub rooms: usize,
    pub users: usize,
    /// Sum over rooms of subscribed connections.
    pub subscriptions: usize,
}

/// Bidirectional connection/room/user index.
#[derive(Debug)]
pub struct MembershipIndex<T> {
    connections: HashMap<ConnectionId, Member<T>>,
    room_members: HashMap<RoomId, HashSet<ConnectionId>>,
    user_connections: HashMap<UserId, HashSet<ConnectionId>>,
    user_rooms: HashMap<UserId, HashSet<RoomId>>,
}

impl<T> Default for MembershipIndex<T> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            room_members: HashMap::new(),
            user_connections: HashMap::new(),
            user_rooms: HashMap::new(),
        }
    }
}

impl<T> MembershipIndex<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. It joins every room its user is already in.
    ///
    /// Returns `false` and leaves the index untouched if `id` is present.
    pub fn insert(&mut self, id: ConnectionId, user_id: UserId, handle: T) -> bool {
        if self.connections.contains_key(&id) {
            return false;
        }

        let rooms = self.user_rooms.entry(user_id).or_default().clone();
        for room in &rooms {
            self.room_members.entry(*room).or_default().insert(id);
        }
        self.user_connections.entry(user_id).or_default().insert(id);
        self.connections.insert(
            id,
            Member {
                user_id,
                rooms,
                handle,
            },
        );
        true
    }

    /// Remove a connection. Returns `None` if it was not registered.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Removed<T>> {
        let member = self.connections.remove(&id)?;
        for room in &member.rooms {
            self.detach(*room, id);
        }

        let last_connection = match self.user_connections.get_mut(&member.user_id) {
            Some(conns) => {
                conns.remove(&id);
                conns.is_empty()
            }
            None => true,
        };

        let mut vacated = Vec::new();
        if last_connection {
            self.user_connections.remove(&member.user_id);
            if let Some(rooms) = self.user_rooms.remove(&member.user_id) {
                vacated.extend(rooms);
                vacated.sort_unstable();
            }
        }

        Some(Removed {
            handle: member.handle,
            user_id: member.user_id,
            last_connection,
            vacated,
        })
    }

    /// Subscribe every live connection of `user_id` to `room_id`.
    ///
    /// Returns `false` when the user has no live connection or is already in
    /// the room.
    pub fn join_user(&mut self, user_id: UserId, room_id: RoomId) -> bool {
        let Some(rooms) = self.user_rooms.get_mut(&user_id) else {
            return false;
        };
        if !rooms.insert(room_id) {
            return false;
        }

        if let Some(conns) = self.user_connections.get(&user_id) {
            let members = self.room_members.entry(room_id).or_default();
            for id in conns {
                members.insert(*id);
                if let Some(member) = self.connections.get_mut(id) {
                    member.rooms.insert(room_id);
                }
            }
        }
        true
    }

    /// Unsubscribe every live connection of `user_id` from `room_id`.
    ///
    /// Returns `false` when the user was not in the room.
    pub fn leave_user(&mut self, user_id: UserId, room_id: RoomId) -> bool {
        let removed = self
            .user_rooms
            .get_mut(&user_id)
            .is_some_and(|rooms| rooms.remove(&room_id));
        if !removed {
            return false;
        }

        let conns: Vec<ConnectionId> = self
            .user_connections
            .get(&user_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        for id in conns {
            if let Some(member) = self.connections.get_mut(&id) {
                member.rooms.remove(&room_id);
            }
            self.detach(room_id, id);
        }
        true
    }

    fn detach(&mut self, room_id: RoomId, id: ConnectionId) {
        let now_empty = match self.room_members.get_mut(&room_id) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.room_members.remove(&room_id);
        }
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Member<T>> {
        self.connections.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Connections subscribed to a room.
    pub fn room_members(&self, room_id: RoomId) -> impl Iterator<Item = ConnectionId> + '_ {
        self.room_members
            .get(&room_id)
            .into_iter()
            .flatten()
            .copied()
    }

    /// Live connections of a user.
    pub fn user_connections(&self, user_id: UserId) -> impl Iterator<Item = ConnectionId> + '_ {
        self.user_connections
            .get(&user_id)
            .into_iter()
            .flatten()
            .copied()
    }

    #[must_use]
    pub fn user_rooms(&self, user_id: UserId) -> Option<&HashSet<RoomId>> {
        self.user_rooms.get(&user_id)
    }

    #[must_use]
    pub fn connection_rooms(&self, id: ConnectionId) -> Option<&HashSet<RoomId>> {
        self.connections.get(&id).map(|m| &m.rooms)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Member<T>)> {
        self.connections.iter().map(|(id, m)| (*id, m))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, Member<T>)> + '_ {
        self.room_members.clear();
        self.user_connections.clear();
        self.user_rooms.clear();
        self.connections.drain()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            connections: self.connections.len(),
            rooms: self.room_members.len(),
            users: self.user_connections.len(),
            subscriptions: self.room_members.values().map(HashSet::len).sum(),
        }
    }

    /// Verify that all four maps agree with each other.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (id, member) in &self.connections {
            let listed = self
                .user_connections
                .get(&member.user_id)
                .is_some_and(|c| c.contains(id));
            if !listed {
                return Err(format!("{id} missing from user {}", member.user_id));
            }
            if self.user_rooms.get(&member.user_id) != Some(&member.rooms) {
                return Err(format!("{id} rooms differ from user {}", member.user_id));
            }
            for room in &member.rooms {
                if !self.room_members.get(room).is_some_and(|m| m.contains(id)) {
                    return Err(format!("{id} missing from room {room}"));
                }
            }
        }

        for (room, members) in &self.room_members {
            if members.is_empty() {
                return Err(format!("room {room} is empty but still indexed"));
            }
            for id in members {
                if !self.connections.get(id).is_some_and(|m| m.rooms.contains(room)) {
                    return Err(format!("room {room} lists stale {id}"));
                }
            }
        }

        for (user, conns) in &self.user_connections {
            if conns.is_empty() {
                return Err(format!("user {user} has no connections but is indexed"));
            }
            if !self.user_rooms.contains_key(user) {
                return Err(format!("user {user} has no room set"));
            }
            for id in conns {
                if self.connections.get(id).map(|m| m.user_id) != Some(*user) {
                    return Err(format!("user {user} lists stale {id}"));
                }
            }
        }

        for user in self.user_rooms.keys() {
            if !self.user_connections.contains_key(user) {
                return Err(format!("user {user} has rooms but no connections"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn user(n: u128) -> UserId {
        Uuid::from_u128(n)
    }

    fn room(n: u128) -> RoomId {
        Uuid::from_u128(1000 + n)
    }

    #[test]
    fn test_join_requires_live_connection() {
        let mut index: MembershipIndex<()> = MembershipIndex::new();
        assert!(!index.join_user(user(1), room(1)));
        assert_eq!(index.stats(), IndexStats::default());
    }

    #[test]
    fn test_second_device_inherits_rooms() {
        let mut index = MembershipIndex::new();
        let phone = ConnectionId::from(1);
        let laptop = ConnectionId::from(2);

        index.insert(phone, user(1), "phone");
        assert!(index.join_user(user(1), room(1)));
        assert!(!index.join_user(user(1), room(1)));

        index.insert(laptop, user(1), "laptop");
        let mut members: Vec<_> = index.room_members(room(1)).collect();
        members.sort();
        assert_eq!(members, vec![phone, laptop]);
        assert!(index.connection_rooms(laptop).unwrap().contains(&room(1)));
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_remove_reports_vacated_rooms_on_last_connection() {
        let mut index = MembershipIndex::new();
        let a = ConnectionId::from(1);
        let b = ConnectionId::from(2);
        index.insert(a, user(1), ());
        index.insert(b, user(1), ());
        index.join_user(user(1), room(2));
        index.join_user(user(1), room(1));

        let first = index.remove(a).unwrap();
        assert!(!first.last_connection);
        assert!(first.vacated.is_empty());
        assert_eq!(index.room_members(room(1)).collect::<Vec<_>>(), vec![b]);

        let second = index.remove(b).unwrap();
        assert!(second.last_connection);
        assert_eq!(second.vacated, vec![room(1), room(2)]);
        assert_eq!(index.stats(), IndexStats::default());

        assert!(index.remove(b).is_none());
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_leave_user_drops_empty_room() {
        let mut index = MembershipIndex::new();
        let a = ConnectionId::from(1);
        index.insert(a, user(1), ());
        index.join_user(user(1), room(1));
        assert_eq!(index.stats().rooms, 1);

        assert!(index.leave_user(user(1), room(1)));
        assert!(!index.leave_user(user(1), room(1)));
        assert_eq!(index.stats().rooms, 0);
        assert!(index.connection_rooms(a).unwrap().is_empty());
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut index = MembershipIndex::new();
        let a = ConnectionId::from(1);
        assert!(index.insert(a, user(1), 1));
        assert!(!index.insert(a, user(2), 2));
        assert_eq!(index.get(a).unwrap().handle, 1);
        assert_eq!(index.stats().users, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(u8),
        Disconnect(u8),
        Join(u8, u8),
        Leave(u8, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Connect),
            (0u8..16).prop_map(Op::Disconnect),
            (0u8..4, 0u8..3).prop_map(|(u, r)| Op::Join(u, r)),
            (0u8..4, 0u8..3).prop_map(|(u, r)| Op::Leave(u, r)),
        ]
    }

    proptest! {
        #[test]
        fn prop_maps_stay_consistent(ops in prop::collection::vec(op(), 0..64)) {
            let mut index = MembershipIndex::new();
            let mut live: Vec<ConnectionId> = Vec::new();
            let mut next = 1u64;

            for op in ops {
                match op {
                    Op::Connect(u) => {
                        let id = ConnectionId::from(next);
                        next += 1;
                        prop_assert!(index.insert(id, user(u128::from(u)), ()));
                        live.push(id);
                    }
                    Op::Disconnect(i) => {
                        if !live.is_empty() {
                            let id = live.remove(usize::from(i) % live.len());
                            prop_assert!(index.remove(id).is_some());
                        }
                    }
                    Op::Join(u, r) => {
                        index.join_user(user(u128::from(u)), room(u128::from(r)));
                    }
                    Op::Leave(u, r) => {
                        index.leave_user(user(u128::from(u)), room(u128::from(r)));
                    }
                }

                if let Err(problem) = index.check_consistency() {
                    return Err(TestCaseError::fail(problem));
                }
                prop_assert_eq!(index.len(), live.len());
            }
        }
    }
}

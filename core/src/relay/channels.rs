//! Channel membership store
//!
//! Rooms are kept in a shared map, but every membership mutation on a room
//! happens under that room's own lock. Two near-simultaneous joiners of the
//! same channel therefore serialize on the room and can never both be
//! admitted past the two-member cap, while unrelated channels never contend.

use super::protocol::RelayErrorKind;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Relay-assigned identifier of one client connection
pub type ConnectionId = u64;

/// Maximum members of a channel
pub const CHANNEL_CAPACITY: usize = 2;

/// A channel's membership
#[derive(Debug)]
struct Room {
    members: Vec<ConnectionId>,
    /// Unix timestamp when the room was created
    created_at: u64,
    /// Set once the room has been removed from the map; holders of a stale
    /// handle must look the channel up again.
    retired: bool,
}

impl Room {
    fn new() -> Self {
        Self {
            members: Vec::with_capacity(CHANNEL_CAPACITY),
            created_at: crate::unix_now(),
            retired: false,
        }
    }
}

/// Result of a join attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joined; the channel still waits for a second member
    Waiting { count: usize },
    /// Joined as the second member; both members listed
    Connected { members: Vec<ConnectionId> },
    /// The caller was already a member; nothing changed
    AlreadyMember { count: usize },
    /// The channel was full; its members were evicted and the caller was not admitted
    Full { evicted: Vec<ConnectionId> },
}

/// Concurrent map of channel id to membership
#[derive(Debug, Default)]
pub struct ChannelStore {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as the first member of a new channel
    pub fn create(&self, id: &str, conn: ConnectionId) -> Result<(), RelayErrorKind> {
        loop {
            let room = self.room_handle(id);
            let mut room = room.lock();
            if room.retired {
                continue;
            }
            if !room.members.is_empty() {
                return Err(RelayErrorKind::ChannelAlreadyExists);
            }
            room.members.push(conn);
            room.created_at = crate::unix_now();
            return Ok(());
        }
    }

    /// Add `conn` to a channel, creating the room if it does not exist
    pub fn join(&self, id: &str, conn: ConnectionId) -> JoinOutcome {
        loop {
            let handle = self.room_handle(id);
            let mut room = handle.lock();
            if room.retired {
                continue;
            }

            if room.members.contains(&conn) {
                return JoinOutcome::AlreadyMember {
                    count: room.members.len(),
                };
            }

            if room.members.len() >= CHANNEL_CAPACITY {
                let evicted = std::mem::take(&mut room.members);
                self.retire(id, &handle, &mut room);
                return JoinOutcome::Full { evicted };
            }

            room.members.push(conn);
            return if room.members.len() == CHANNEL_CAPACITY {
                JoinOutcome::Connected {
                    members: room.members.clone(),
                }
            } else {
                JoinOutcome::Waiting {
                    count: room.members.len(),
                }
            };
        }
    }

    /// Remove `conn` from a channel.
    ///
    /// Returns the remaining members, or `None` if `conn` was not a member.
    pub fn leave(&self, id: &str, conn: ConnectionId) -> Option<Vec<ConnectionId>> {
        let handle = self.existing(id)?;
        let mut room = handle.lock();
        if room.retired {
            return None;
        }

        let position = room.members.iter().position(|m| *m == conn)?;
        room.members.remove(position);
        let remaining = room.members.clone();

        if remaining.is_empty() {
            self.retire(id, &handle, &mut room);
        }

        Some(remaining)
    }

    /// Current members of a channel
    pub fn members(&self, id: &str) -> Vec<ConnectionId> {
        self.existing(id)
            .map(|room| room.lock().members.clone())
            .unwrap_or_default()
    }

    /// Number of members of a channel (0 if it does not exist)
    pub fn member_count(&self, id: &str) -> usize {
        self.existing(id).map_or(0, |room| room.lock().members.len())
    }

    /// Creation time of a channel, if it exists
    pub fn created_at(&self, id: &str) -> Option<u64> {
        self.existing(id).map(|room| room.lock().created_at)
    }

    /// Number of channels with at least one member
    pub fn channel_count(&self) -> usize {
        let rooms: Vec<_> = self.rooms.read().values().cloned().collect();
        rooms.iter().filter(|room| !room.lock().members.is_empty()).count()
    }

    // The map guard is released before the room is locked
    fn existing(&self, id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().get(id).cloned()
    }

    fn room_handle(&self, id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.rooms.read().get(id) {
            return Arc::clone(room);
        }
        let mut rooms = self.rooms.write();
        Arc::clone(
            rooms
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Room::new()))),
        )
    }

    // Called with the room lock held. Lock order is always room -> map.
    fn retire(&self, id: &str, handle: &Arc<Mutex<Room>>, room: &mut Room) {
        room.retired = true;
        let mut rooms = self.rooms.write();
        if rooms.get(id).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            rooms.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "7d7a1c2e-2b5f-4d7e-9c1a-3e4f5a6b7c8d";

    #[test]
    fn test_create_then_join_connects() {
        let store = ChannelStore::new();
        store.create(ID, 1).expect("Failed to create");

        assert_eq!(store.join(ID, 2), JoinOutcome::Connected { members: vec![1, 2] });
        assert_eq!(store.member_count(ID), 2);
    }

    #[test]
    fn test_create_existing_fails() {
        let store = ChannelStore::new();
        store.create(ID, 1).unwrap();
        assert_eq!(store.create(ID, 2), Err(RelayErrorKind::ChannelAlreadyExists));
    }

    #[test]
    fn test_join_empty_channel_waits() {
        let store = ChannelStore::new();
        assert_eq!(store.join(ID, 1), JoinOutcome::Waiting { count: 1 });
        assert!(store.created_at(ID).is_some());
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let store = ChannelStore::new();
        store.join(ID, 1);
        assert_eq!(store.join(ID, 1), JoinOutcome::AlreadyMember { count: 1 });
        assert_eq!(store.member_count(ID), 1);
    }

    #[test]
    fn test_third_join_evicts_everyone() {
        let store = ChannelStore::new();
        store.join(ID, 1);
        store.join(ID, 2);

        assert_eq!(store.join(ID, 3), JoinOutcome::Full { evicted: vec![1, 2] });
        assert_eq!(store.member_count(ID), 0);
        assert_eq!(store.channel_count(), 0);
    }

    #[test]
    fn test_leave_last_member_destroys_room() {
        let store = ChannelStore::new();
        store.join(ID, 1);
        store.join(ID, 2);

        assert_eq!(store.leave(ID, 1), Some(vec![2]));
        assert_eq!(store.leave(ID, 2), Some(vec![]));
        assert_eq!(store.leave(ID, 2), None);
        assert!(store.created_at(ID).is_none());

        // A fresh create succeeds once the room is gone
        assert!(store.create(ID, 3).is_ok());
    }

    #[test]
    fn test_concurrent_joins_respect_capacity() {
        let store = Arc::new(ChannelStore::new());
        let handles: Vec<_> = (0..8u64)
            .map(|conn| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.join(ID, conn))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(store.member_count(ID) <= CHANNEL_CAPACITY);
    }
}

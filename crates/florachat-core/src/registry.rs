//! Room membership registry
//!
//! Tracks which rooms are joined over the session connection and decides which
//! inbound events may be routed to a room's store. Rooms are keyed by id in a
//! single map, so a room can never hold two joined entries at once.
//!
//! Every join bumps the room's generation. Asynchronous work started for a room
//! (history fetches) carries the generation it was started under and is
//! discarded if the room was left or re-joined in the meantime.

use crate::types::RoomId;
use hashbrown::HashMap;
use tracing::debug;

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room newly joined; a `join` frame is due
    Joined { generation: u64 },
    /// Room was already joined; nothing to do
    AlreadyJoined { generation: u64 },
}

impl JoinOutcome {
    pub fn generation(&self) -> u64 {
        match self {
            JoinOutcome::Joined { generation } | JoinOutcome::AlreadyJoined { generation } => {
                *generation
            }
        }
    }

    /// Whether a `join` frame must be emitted
    pub fn needs_frame(&self) -> bool {
        matches!(self, JoinOutcome::Joined { .. })
    }
}

/// Result of a leave request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Room was joined and is now left; a `leave` frame is due
    Left,
    /// Room was not joined
    NotJoined,
}

// ----------------------------------------------------------------------------
// Room Entry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RoomEntry {
    joined: bool,
    generation: u64,
    /// Position in join order, used for reconnect replay
    join_sequence: u64,
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub joins: u64,
    pub leaves: u64,
    pub duplicate_joins: u64,
    pub events_routed: u64,
    pub events_dropped: u64,
}

// ----------------------------------------------------------------------------
// Room Registry
// ----------------------------------------------------------------------------

/// Set of rooms joined over the session connection
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, RoomEntry>,
    next_generation: u64,
    next_sequence: u64,
    stats: RegistryStats,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room; idempotent
    pub fn join_room(&mut self, room_id: &RoomId) -> JoinOutcome {
        if let Some(entry) = self.rooms.get(room_id) {
            if entry.joined {
                self.stats.duplicate_joins += 1;
                return JoinOutcome::AlreadyJoined {
                    generation: entry.generation,
                };
            }
        }

        self.next_generation += 1;
        self.next_sequence += 1;
        let generation = self.next_generation;
        self.rooms.insert(
            room_id.clone(),
            RoomEntry {
                joined: true,
                generation,
                join_sequence: self.next_sequence,
            },
        );
        self.stats.joins += 1;
        debug!(room_id = %room_id, generation, "room joined");
        JoinOutcome::Joined { generation }
    }

    /// Leave a room; late events for it are dropped from now on
    pub fn leave_room(&mut self, room_id: &RoomId) -> LeaveOutcome {
        match self.rooms.get_mut(room_id) {
            Some(entry) if entry.joined => {
                entry.joined = false;
                self.stats.leaves += 1;
                debug!(room_id = %room_id, "room left");
                LeaveOutcome::Left
            }
            _ => LeaveOutcome::NotJoined,
        }
    }

    /// Leave `from` (if any) and join `to` as one step
    pub fn switch_room(&mut self, from: Option<&RoomId>, to: &RoomId) -> (LeaveOutcome, JoinOutcome) {
        let left = match from {
            Some(from) if from != to => self.leave_room(from),
            _ => LeaveOutcome::NotJoined,
        };
        let joined = self.join_room(to);
        (left, joined)
    }

    pub fn is_joined(&self, room_id: &RoomId) -> bool {
        self.rooms.get(room_id).map(|e| e.joined).unwrap_or(false)
    }

    /// Current generation of a joined room
    pub fn generation(&self, room_id: &RoomId) -> Option<u64> {
        self.rooms
            .get(room_id)
            .filter(|e| e.joined)
            .map(|e| e.generation)
    }

    /// Whether work started under `generation` may still touch the room
    pub fn is_current(&self, room_id: &RoomId, generation: u64) -> bool {
        self.generation(room_id) == Some(generation)
    }

    /// Decide whether an inbound event tagged with `room_id` may be delivered
    pub fn route(&mut self, room_id: &RoomId) -> bool {
        if self.is_joined(room_id) {
            self.stats.events_routed += 1;
            true
        } else {
            self.stats.events_dropped += 1;
            debug!(room_id = %room_id, "dropping event for room that is not joined");
            false
        }
    }

    /// Joined rooms in the order they were joined
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        let mut joined: Vec<(&RoomId, u64)> = self
            .rooms
            .iter()
            .filter(|(_, e)| e.joined)
            .map(|(id, e)| (id, e.join_sequence))
            .collect();
        joined.sort_by_key(|(_, sequence)| *sequence);
        joined.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn joined_count(&self) -> usize {
        self.rooms.values().filter(|e| e.joined).count()
    }

    /// Forget left rooms entirely
    pub fn prune_left(&mut self) {
        self.rooms.retain(|_, e| e.joined);
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

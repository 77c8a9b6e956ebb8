//! # Room Registry
//!
//! Process-wide map from room id to live room. Rooms are created on first
//! join and removed when their last participant leaves, so the registry
//! never holds an empty room.
//!
//! ## Locking:
//! Join and leave for one room run under that room's map shard lock
//! (`DashMap::entry` / `DashMap::remove_if`). A join racing with the last
//! leave therefore either lands in the existing room before it is removed,
//! or creates a fresh room after it is gone. Rooms in other shards are
//! never blocked.

use crate::error::RelayError;
use crate::protocol::{Outbound, ServerMessage};
use crate::room::participant::{Participant, ParticipantId, RoomId};
use crate::room::room::{DeliveryReport, Room};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh room id.
    ///
    /// The room itself is not materialized until someone joins it.
    pub fn create_room(&self) -> RoomId {
        loop {
            let simple = Uuid::new_v4().simple().to_string();
            let room_id = format!("room-{}", &simple[..6]);
            if !self.rooms.contains_key(&room_id) {
                debug!(room_id = %room_id, "Allocated room id");
                return room_id;
            }
        }
    }

    /// Return the live room for `room_id`, creating it if absent.
    pub fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        self.room_entry(room_id).clone()
    }

    // Holds the shard lock until the returned guard drops
    fn room_entry(&self, room_id: &str) -> RefMut<'_, RoomId, Arc<Room>> {
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            info!(room_id = %room_id, "Room created");
            Arc::new(Room::new(room_id.to_string()))
        })
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|room| room.clone())
    }

    /// Add a participant to its room, creating the room if needed.
    ///
    /// Returns the room size after the join.
    pub fn add_participant(&self, participant: Participant) -> Result<usize, RelayError> {
        let room_id = participant.room_id.clone();
        let participant_id = participant.id.clone();

        let count = self.room_entry(&room_id).join(participant);

        // A rejected join must not leave behind a room it created
        if count.is_err() {
            self.rooms.remove_if(&room_id, |_, room| room.is_empty());
        }

        let count = count?;
        info!(room_id = %room_id, participant_id = %participant_id, participants = count, "Participant joined");
        Ok(count)
    }

    /// Remove a participant. Idempotent; returns whether it was a member.
    ///
    /// Drops the room once it is empty.
    pub fn remove_participant(&self, room_id: &str, participant_id: &ParticipantId) -> bool {
        let mut removed = false;
        let room_dropped = self
            .rooms
            .remove_if(room_id, |_, room| {
                removed = room.leave(participant_id).is_some();
                room.is_empty()
            })
            .is_some();

        if removed {
            info!(room_id = %room_id, participant_id = %participant_id, "Participant left");
        }
        if room_dropped {
            info!(room_id = %room_id, "Room removed");
        }
        removed
    }

    pub fn participant_count(&self, room_id: &str) -> usize {
        self.get(room_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver a frame to every participant of the room except `exclude`.
    pub fn broadcast(&self, room_id: &str, exclude: Option<&ParticipantId>, frame: Outbound) -> DeliveryReport {
        let Some(room) = self.get(room_id) else {
            return DeliveryReport::default();
        };
        let report = room.broadcast(exclude, &frame);
        self.drop_failed(room_id, &room, &report);
        report
    }

    /// Deliver a frame to the participants (except `exclude`) listening in `language`.
    pub fn broadcast_to_language(
        &self,
        room_id: &str,
        exclude: Option<&ParticipantId>,
        language: &str,
        frame: Outbound,
    ) -> DeliveryReport {
        let Some(room) = self.get(room_id) else {
            return DeliveryReport::default();
        };
        let report = room.broadcast_to_language(exclude, language, &frame);
        self.drop_failed(room_id, &room, &report);
        report
    }

    /// Tell everyone in the room the current head count.
    pub fn broadcast_participant_count(&self, room_id: &str) -> DeliveryReport {
        let count = self.participant_count(room_id);
        self.broadcast(room_id, None, Outbound::Event(ServerMessage::ParticipantCount { count }))
    }

    // Recipients that failed delivery are removed and told to close; the rest of
    // the room then hears the new count. Each round removes at least one member,
    // so the cascade ends.
    fn drop_failed(&self, room_id: &str, room: &Room, report: &DeliveryReport) {
        if report.failed.is_empty() {
            return;
        }

        let evicted: Vec<_> = report
            .failed
            .iter()
            .filter_map(|id| {
                let member = room.snapshot().into_iter().find(|p| &p.id == id);
                self.remove_participant(room_id, id).then_some(member).flatten()
            })
            .collect();

        for member in &evicted {
            member.flags.mark_closed();
            member.evict();
        }

        if !evicted.is_empty() {
            self.broadcast_participant_count(room_id);
        }
    }
}

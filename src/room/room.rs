//! # Room Membership and Fan-out
//!
//! A room is a set of live participants. Membership changes go through a
//! write lock; broadcasts take a snapshot under the read lock and deliver
//! outside it, so a slow or failing recipient never holds up membership
//! changes or the other recipients.

use crate::error::RelayError;
use crate::protocol::Outbound;
use crate::room::participant::{Participant, ParticipantId, RoomId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients whose delivery failed; they should be dropped from the room
    pub failed: Vec<ParticipantId>,
}

pub struct Room {
    id: RoomId,
    created_at: DateTime<Utc>,
    members: RwLock<HashMap<ParticipantId, Arc<Participant>>>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // A panic while holding the lock leaves the map itself intact, so poisoning is ignored
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ParticipantId, Arc<Participant>>> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ParticipantId, Arc<Participant>>> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a participant. Rejects members addressed to another room and duplicate ids.
    pub fn join(&self, participant: Participant) -> Result<usize, RelayError> {
        if participant.room_id != self.id {
            return Err(RelayError::Membership(format!(
                "participant {} belongs to room {}, not {}",
                participant.id, participant.room_id, self.id
            )));
        }

        let mut members = self.write();
        if members.contains_key(&participant.id) {
            return Err(RelayError::Membership(format!(
                "participant {} is already in room {}",
                participant.id, self.id
            )));
        }

        members.insert(participant.id.clone(), Arc::new(participant));
        Ok(members.len())
    }

    /// Remove a participant; returns the removed member if it was present.
    pub fn leave(&self, participant_id: &ParticipantId) -> Option<Arc<Participant>> {
        self.write().remove(participant_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// A consistent copy of the current membership.
    pub fn snapshot(&self) -> Vec<Arc<Participant>> {
        self.read().values().cloned().collect()
    }

    /// Deliver a frame to every member except `exclude`.
    pub fn broadcast(&self, exclude: Option<&ParticipantId>, frame: &Outbound) -> DeliveryReport {
        self.fan_out(frame, |p| Some(&p.id) != exclude)
    }

    /// Deliver a frame to the members (except `exclude`) who speak `language`.
    pub fn broadcast_to_language(
        &self,
        exclude: Option<&ParticipantId>,
        language: &str,
        frame: &Outbound,
    ) -> DeliveryReport {
        self.fan_out(frame, |p| Some(&p.id) != exclude && p.language == language)
    }

    fn fan_out<F>(&self, frame: &Outbound, include: F) -> DeliveryReport
    where
        F: Fn(&Participant) -> bool,
    {
        let mut report = DeliveryReport::default();

        for participant in self.snapshot().iter().filter(|p| include(p)) {
            match participant.deliver(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        room_id = %self.id,
                        participant_id = %participant.id,
                        frame = frame.kind(),
                        error = %err,
                        "Delivery failed, dropping participant"
                    );
                    report.failed.push(participant.id.clone());
                }
            }
        }

        report
    }
}

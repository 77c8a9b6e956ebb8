//! Participant identity and the delivery handle rooms fan out to.

use crate::error::RelayError;
use crate::protocol::Outbound;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque participant id, generated when a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub type RoomId = String;

/// Where a room delivers frames for one participant.
///
/// Implementations must not block: `deliver` enqueues the frame on the
/// participant's own connection and returns. Frames delivered to one sink
/// must reach the client in the order they were delivered.
pub trait ParticipantSink: Send + Sync {
    /// Queue a frame. An error means the connection is gone or cannot keep up.
    fn deliver(&self, frame: Outbound) -> Result<(), RelayError>;

    /// Ask the connection to shut down after it was dropped from its room.
    fn evict(&self) {}
}

/// State shared between a session actor and work it dispatched.
///
/// The actor owns everything else about the session; these two flags are
/// what a flush job needs to see from another task.
#[derive(Debug, Default)]
pub struct SessionFlags {
    closed: AtomicBool,
    translating: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the single in-flight translate slot. Returns false if a
    /// translate is already outstanding.
    pub fn try_begin_translation(&self) -> bool {
        self.translating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_translation(&self) {
        self.translating.store(false, Ordering::Release);
    }

    pub fn is_translating(&self) -> bool {
        self.translating.load(Ordering::Acquire)
    }
}

/// A room member as seen by the room: identity, language and delivery handle.
#[derive(Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub room_id: RoomId,
    /// Language this participant speaks and wants to hear
    pub language: String,
    pub joined_at: DateTime<Utc>,
    pub flags: Arc<SessionFlags>,
    sink: Arc<dyn ParticipantSink>,
}

impl Participant {
    pub fn new(
        id: ParticipantId,
        room_id: RoomId,
        language: String,
        flags: Arc<SessionFlags>,
        sink: Arc<dyn ParticipantSink>,
    ) -> Self {
        Self {
            id,
            room_id,
            language,
            joined_at: Utc::now(),
            flags,
            sink,
        }
    }

    pub fn deliver(&self, frame: Outbound) -> Result<(), RelayError> {
        self.sink.deliver(frame)
    }

    pub fn evict(&self) {
        self.sink.evict();
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("language", &self.language)
            .field("joined_at", &self.joined_at)
            .finish()
    }
}

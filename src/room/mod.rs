//! # Rooms
//!
//! Named groups of participants that hear each other's speech translated
//! into their own language.
//!
//! ## Key Components:
//! - **Participant**: identity, language and the sink frames are delivered to
//! - **Room**: membership set with snapshot-based fan-out
//! - **Registry**: process-wide room map, creates and drops rooms with membership

pub mod participant;
#[allow(clippy::module_inception)]
pub mod room;
pub mod registry;

pub use participant::{Participant, ParticipantId, ParticipantSink, RoomId, SessionFlags};
pub use registry::RoomRegistry;
pub use room::{DeliveryReport, Room};

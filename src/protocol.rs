//! # Room WebSocket Protocol
//!
//! ## Message Format:
//! - **Client → Server (text)**: `{"type":"ping"}` or `{"type":"close"}`
//! - **Client → Server (binary)**: raw PCM, 16-bit signed, mono, 16kHz
//! - **Server → Client (text)**: JSON events tagged by `type`
//! - **Server → Client (binary)**: translated audio, optionally WAVE-wrapped
//!
//! ## Connection Flow:
//! 1. Client connects to `/ws/{room_id}?target_lang=xx`
//! 2. Server sends `connection_established` with the generated `user_id`
//! 3. Everyone in the room gets a `participant_count` update
//! 4. Client streams audio; other participants receive `translation_result`
//!    events and translated audio

use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};

/// Control frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keepalive, answered with `pong`
    Ping,

    /// Graceful session close
    Close,
}

/// JSON events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after the handshake
    ConnectionEstablished { room_id: String, user_id: String },

    Pong,

    /// Another participant's speech, transcribed and translated
    TranslationResult {
        original_text: String,
        translated_text: String,
        /// Language of `translated_text`
        language: String,
        /// Speaker's participant id
        user_id: String,
    },

    /// Room membership changed
    ParticipantCount { count: usize },

    /// A frame from this client was rejected
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

/// One frame queued for delivery to a participant.
///
/// Audio is reference-counted so a broadcast to many recipients shares one buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerMessage),
    Audio(Bytes),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Event(_) => "event",
            Outbound::Audio(_) => "audio",
        }
    }
}

/// Parse a client text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

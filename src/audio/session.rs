//! # Participant Session
//!
//! Per-connection state for one participant in one room: lifecycle, audio
//! buffer, protocol error budget and liveness tracking. The WebSocket actor
//! owns its session outright, so nothing here is locked. The only state a
//! dispatched flush job can see is the shared [`SessionFlags`].
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: handshake accepted, not yet in a room
//! 2. **Active**: registered in the room, streaming audio
//! 3. **Closing**: close requested, timed out, evicted or protocol failure
//! 4. **Closed**: removed from the room, resources released

use crate::audio::buffer::{AudioBuffer, AudioBufferConfig};
use crate::audio::processor::AudioProcessor;
use crate::error::RelayError;
use crate::protocol::{parse_client_message, ClientMessage};
use crate::room::{ParticipantId, RoomId, SessionFlags};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Connecting, SessionState::Closing)
                | (SessionState::Active, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }
}

/// Why a session is shutting down.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    ClientRequested,
    ProtocolViolation(String),
    IdleTimeout,
    Evicted,
    TransportClosed,
    HandshakeFailed(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientRequested => "client_requested",
            CloseReason::ProtocolViolation(_) => "protocol_violation",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Evicted => "evicted",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::HandshakeFailed(_) => "handshake_failed",
        }
    }
}

/// What the actor should do with a text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    Pong,
    Close,
    /// Frame rejected; tell the client and carry on
    Reject(RelayError),
    /// Too many consecutive bad frames
    CloseProtocol(RelayError),
}

/// Result of the periodic liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    SendKeepalive,
    TimedOut,
}

/// Session tuning taken from configuration when the connection opens.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer: AudioBufferConfig,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub max_protocol_errors: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub audio_bytes: u64,
    pub audio_frames: u64,
    pub flushes: u64,
    pub deferred_flushes: u64,
}

pub struct ParticipantSession {
    pub id: ParticipantId,
    pub room_id: RoomId,
    pub language: String,
    state: SessionState,
    config: SessionConfig,
    processor: AudioProcessor,
    // Created on the first audio frame so the flush timer starts with speech
    buffer: Option<AudioBuffer>,
    last_activity: Instant,
    protocol_errors: u32,
    flags: Arc<SessionFlags>,
    stats: SessionStats,
}

impl ParticipantSession {
    pub fn new(
        room_id: RoomId,
        language: String,
        config: SessionConfig,
        processor: AudioProcessor,
        now: Instant,
    ) -> Self {
        Self {
            id: ParticipantId::generate(),
            room_id,
            language,
            state: SessionState::Connecting,
            config,
            processor,
            buffer: None,
            last_activity: now,
            protocol_errors: 0,
            flags: SessionFlags::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> Arc<SessionFlags> {
        self.flags.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn transition(&mut self, next: SessionState) -> Result<(), RelayError> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        debug!(
            participant_id = %self.id,
            room_id = %self.room_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Session state change"
        );
        self.state = next;
        Ok(())
    }

    /// Connecting → Active, once the participant is registered in its room.
    pub fn activate(&mut self) -> Result<(), RelayError> {
        self.transition(SessionState::Active)
    }

    /// Active/Connecting → Closing. Marks the session closed for any
    /// flush job still holding its flags.
    pub fn begin_close(&mut self, reason: &CloseReason) -> Result<(), RelayError> {
        self.transition(SessionState::Closing)?;
        self.flags.mark_closed();
        debug!(participant_id = %self.id, reason = reason.as_str(), "Session closing");
        Ok(())
    }

    /// Closing → Closed, after the room no longer lists the participant.
    pub fn finish_close(&mut self) -> Result<(), RelayError> {
        self.transition(SessionState::Closed)?;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
        Ok(())
    }

    /// Inbound traffic of any kind keeps the session alive.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Handle a text control frame.
    pub fn on_text_at(&mut self, text: &str, now: Instant) -> ControlAction {
        self.touch(now);
        match parse_client_message(text) {
            Ok(ClientMessage::Ping) => {
                self.protocol_errors = 0;
                ControlAction::Pong
            }
            Ok(ClientMessage::Close) => {
                self.protocol_errors = 0;
                ControlAction::Close
            }
            Err(e) => self.on_protocol_error(RelayError::Protocol(format!("Invalid control frame: {}", e))),
        }
    }

    /// Handle a binary audio frame.
    ///
    /// Returns the audio to translate when the flush gate opens and no
    /// translate is outstanding for this session. The caller then owns the
    /// in-flight slot and must hand it to the dispatcher. While a translate
    /// is outstanding the flush is deferred and audio keeps accumulating.
    pub fn on_audio_at(&mut self, chunk: &[u8], now: Instant) -> Result<Option<Vec<u8>>, ControlAction> {
        self.touch(now);
        if let Err(e) = self.processor.validate_frame(chunk) {
            return Err(self.on_protocol_error(e));
        }
        self.protocol_errors = 0;

        if self.state != SessionState::Active {
            return Ok(None);
        }

        let buffer_config = self.config.buffer.clone();
        let buffer = self
            .buffer
            .get_or_insert_with(|| AudioBuffer::new_at(buffer_config, now));
        buffer.append(chunk);
        self.stats.audio_bytes += chunk.len() as u64;
        self.stats.audio_frames += 1;

        if !buffer.should_flush_at(now) {
            return Ok(None);
        }
        if !self.flags.try_begin_translation() {
            self.stats.deferred_flushes += 1;
            debug!(
                participant_id = %self.id,
                buffered_bytes = buffer.len(),
                "Flush deferred, translation in flight"
            );
            return Ok(None);
        }

        let audio = buffer.flush_at(now);
        self.stats.flushes += 1;
        debug!(
            participant_id = %self.id,
            audio_bytes = audio.len(),
            seconds = self.processor.format().duration_seconds(audio.len()),
            peak = self.processor.peak_amplitude(&audio),
            dropped_bytes = buffer.dropped_bytes(),
            "Buffer flushed"
        );
        Ok(Some(audio))
    }

    /// Count a malformed frame against the session's error budget.
    pub fn on_protocol_error(&mut self, error: RelayError) -> ControlAction {
        self.protocol_errors += 1;
        if self.protocol_errors >= self.config.max_protocol_errors {
            ControlAction::CloseProtocol(error)
        } else {
            ControlAction::Reject(error)
        }
    }

    /// Decide whether the session needs a keepalive or must be closed.
    pub fn check_liveness(&self, now: Instant) -> Liveness {
        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= self.config.idle_timeout {
            Liveness::TimedOut
        } else if idle >= self.config.ping_interval {
            Liveness::SendKeepalive
        } else {
            Liveness::Healthy
        }
    }

    /// When the session times out unless more traffic arrives.
    pub fn idle_deadline(&self) -> Instant {
        self.last_activity + self.config.idle_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }
}

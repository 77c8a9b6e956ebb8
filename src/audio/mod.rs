//! # Audio Processing Module
//!
//! Per-participant audio handling for the room relay.
//!
//! ## Key Components:
//! - **Audio Buffer**: sliding window with a time- and size-gated flush
//! - **Audio Processor**: PCM frame validation
//! - **Participant Session**: lifecycle state machine owning the buffer
//! - **WAV**: container for outbound translated audio
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod processor;
pub mod session;
pub mod wav;

pub use buffer::{AudioBuffer, AudioBufferConfig};
pub use processor::{AudioProcessor, PcmFormat};
pub use session::{CloseReason, ControlAction, Liveness, ParticipantSession, SessionConfig, SessionState};
pub use wav::encode_wav;

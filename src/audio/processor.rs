//! # Audio Frame Validation
//!
//! Checks inbound binary frames before they reach a participant's buffer.
//! Clients send raw PCM (16-bit signed little-endian, mono, 16kHz); anything
//! that cannot be that format is a protocol error for the session.

use crate::config::AudioSettings;
use crate::error::RelayError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// The PCM format a relay instance accepts and emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    pub fn from_settings(settings: &AudioSettings) -> Self {
        Self::new(settings.sample_rate, settings.channels, settings.bit_depth)
    }

    /// Bytes per sample frame across all channels.
    pub fn block_align(&self) -> u16 {
        self.channels * (self.bit_depth / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Duration of `len` bytes of this format, in seconds.
    pub fn duration_seconds(&self, len: usize) -> f64 {
        let rate = self.byte_rate();
        if rate == 0 {
            0.0
        } else {
            len as f64 / rate as f64
        }
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::from_settings(&AudioSettings::default())
    }
}

/// Validates inbound audio frames against the configured format.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    format: PcmFormat,
}

impl AudioProcessor {
    pub fn new(format: PcmFormat) -> Self {
        Self { format }
    }

    /// Validate one binary frame.
    ///
    /// ## Validation Checks:
    /// 1. **Non-empty**: an empty frame carries no audio
    /// 2. **Frame alignment**: length must be a whole number of sample frames
    pub fn validate_frame(&self, data: &[u8]) -> Result<(), RelayError> {
        if data.is_empty() {
            return Err(RelayError::Protocol("Audio frame is empty".to_string()));
        }

        let align = self.format.block_align() as usize;
        if align > 0 && data.len() % align != 0 {
            return Err(RelayError::Protocol(format!(
                "Audio frame length {} is not a multiple of the {}-byte sample frame",
                data.len(),
                align
            )));
        }

        Ok(())
    }

    /// Peak absolute sample value of a 16-bit frame, used for debug logging.
    pub fn peak_amplitude(&self, data: &[u8]) -> u16 {
        let mut cursor = Cursor::new(data);
        let mut peak = 0u16;
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            peak = peak.max(sample.unsigned_abs());
        }
        peak
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }
}

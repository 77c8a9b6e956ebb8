//! # Audio Buffer Management
//!
//! Implements the per-participant byte accumulator that sits between the
//! WebSocket receive loop and the translator.
//!
//! ## Key Features:
//! - **Sliding window**: never holds more than `max_window_bytes`; the oldest
//!   bytes are dropped first
//! - **Dual flush gate**: a flush needs enough audio *and* enough time since
//!   the previous flush, which avoids both micro-requests and unbounded latency
//! - **Tail retention**: after a flush a short tail is kept so a word split
//!   across a chunk boundary is heard again in the next segment
//!
//! ## Ownership:
//! A buffer belongs to exactly one session actor and is only touched from that
//! actor's context, so there is no locking here (unlike a buffer shared with a
//! transcription thread).

use crate::config::AudioSettings;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Configuration for audio buffer behavior, in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBufferConfig {
    /// Buffered bytes required before a flush may fire
    pub flush_threshold_bytes: usize,

    /// Minimum time between two flushes
    pub min_flush_interval: Duration,

    /// Sliding window bound
    pub max_window_bytes: usize,

    /// One client chunk; caps the tail retained after a flush
    pub chunk_size_bytes: usize,
}

impl AudioBufferConfig {
    /// Derive byte sizes from the configured PCM format.
    pub fn from_settings(settings: &AudioSettings) -> Self {
        Self {
            flush_threshold_bytes: settings.flush_threshold_bytes(),
            min_flush_interval: settings.min_flush_interval(),
            max_window_bytes: settings.max_window_bytes(),
            chunk_size_bytes: settings.chunk_size_bytes,
        }
    }
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self::from_settings(&AudioSettings::default())
    }
}

/// Sliding-window PCM accumulator for one participant.
///
/// Time-dependent methods take the instant explicitly (`*_at(now)`) so the
/// owning session and tests drive the clock.
#[derive(Debug)]
pub struct AudioBuffer {
    bytes: VecDeque<u8>,
    config: AudioBufferConfig,
    last_flush: Instant,
    dropped_bytes: u64,
}

impl AudioBuffer {
    /// Create an empty buffer. The flush timer starts at `now`, so the first
    /// flush also has to wait `min_flush_interval`.
    pub fn new_at(config: AudioBufferConfig, now: Instant) -> Self {
        Self {
            bytes: VecDeque::with_capacity(config.max_window_bytes),
            config,
            last_flush: now,
            dropped_bytes: 0,
        }
    }

    /// Append a chunk, dropping the oldest bytes if the window overflows.
    pub fn append(&mut self, chunk: &[u8]) {
        let max = self.config.max_window_bytes;

        // A single chunk larger than the window only keeps its newest bytes
        let chunk = if chunk.len() > max {
            let skip = chunk.len() - max;
            self.dropped_bytes += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(max);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped_bytes += overflow as u64;
        }

        self.bytes.extend(chunk.iter().copied());
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    /// `len >= threshold AND now - last_flush >= min_interval`
    pub fn should_flush_at(&self, now: Instant) -> bool {
        self.bytes.len() >= self.config.flush_threshold_bytes
            && now.saturating_duration_since(self.last_flush) >= self.config.min_flush_interval
    }

    pub fn flush(&mut self) -> Vec<u8> {
        self.flush_at(Instant::now())
    }

    /// Take the whole buffer, keep `min(len / 4, chunk_size)` trailing bytes
    /// and restart the flush timer.
    pub fn flush_at(&mut self, now: Instant) -> Vec<u8> {
        let flushed: Vec<u8> = self.bytes.drain(..).collect();
        let tail_len = Self::tail_len(flushed.len(), self.config.chunk_size_bytes);

        self.bytes.extend(flushed[flushed.len() - tail_len..].iter().copied());
        self.last_flush = now;

        flushed
    }

    fn tail_len(flushed_len: usize, chunk_size: usize) -> usize {
        (flushed_len / 4).min(chunk_size)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Total bytes discarded by the sliding window since creation.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AudioBufferConfig {
        AudioBufferConfig {
            flush_threshold_bytes: 8,
            min_flush_interval: Duration::from_millis(500),
            max_window_bytes: 32,
            chunk_size_bytes: 4,
        }
    }

    #[test]
    fn test_window_bound_holds_after_every_append() {
        let start = Instant::now();
        let mut buffer = AudioBuffer::new_at(small_config(), start);

        for i in 0..20u8 {
            buffer.append(&[i; 5]);
            assert!(buffer.len() <= 32, "window exceeded: {}", buffer.len());
        }

        // 100 bytes in, 32 kept, 68 dropped from the front
        assert_eq!(buffer.len(), 32);
        assert_eq!(buffer.dropped_bytes(), 68);
    }

    #[test]
    fn test_sliding_window_keeps_newest_bytes() {
        let mut buffer = AudioBuffer::new_at(small_config(), Instant::now());
        let data: Vec<u8> = (0..40).collect();
        buffer.append(&data);

        let flushed = buffer.flush_at(Instant::now());
        assert_eq!(flushed, (8..40).collect::<Vec<u8>>());
    }

    #[test]
    fn test_flush_requires_both_gates() {
        let start = Instant::now();
        let mut buffer = AudioBuffer::new_at(small_config(), start);

        // Size met, time not met
        buffer.append(&[1; 10]);
        assert!(!buffer.should_flush_at(start + Duration::from_millis(100)));

        // Time met, size met
        assert!(buffer.should_flush_at(start + Duration::from_millis(500)));

        // Time met, size not met
        let mut small = AudioBuffer::new_at(small_config(), start);
        small.append(&[1; 4]);
        assert!(!small.should_flush_at(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_flush_resets_time_gate() {
        let start = Instant::now();
        let mut buffer = AudioBuffer::new_at(small_config(), start);
        buffer.append(&[1; 16]);

        let flushed_at = start + Duration::from_millis(600);
        assert!(buffer.should_flush_at(flushed_at));
        buffer.flush_at(flushed_at);

        // Refill past the threshold: still gated by the interval
        buffer.append(&[2; 16]);
        assert!(!buffer.should_flush_at(flushed_at));
        assert!(!buffer.should_flush_at(flushed_at + Duration::from_millis(499)));
        assert!(buffer.should_flush_at(flushed_at + Duration::from_millis(500)));
    }

    #[test]
    fn test_wall_clock_gates() {
        let mut config = small_config();
        config.min_flush_interval = Duration::ZERO;
        let mut buffer = AudioBuffer::new_at(config, Instant::now());
        buffer.append(&[1; 16]);
        assert!(buffer.should_flush());
        assert_eq!(buffer.flush().len(), 16);

        let mut config = small_config();
        config.min_flush_interval = Duration::from_secs(60);
        let mut buffer = AudioBuffer::new_at(config, Instant::now());
        buffer.append(&[1; 16]);
        assert!(!buffer.should_flush());
    }

    #[test]
    fn test_tail_retention_length() {
        let config = small_config();

        // 12 bytes flushed: 12 / 4 = 3, below the 4-byte chunk cap
        let mut buffer = AudioBuffer::new_at(config.clone(), Instant::now());
        let data: Vec<u8> = (0..12).collect();
        buffer.append(&data);
        let flushed = buffer.flush_at(Instant::now());
        assert_eq!(flushed.len(), 12);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.flush_at(Instant::now()), vec![9, 10, 11]);

        // 32 bytes flushed: 32 / 4 = 8, capped at one chunk (4)
        let mut buffer = AudioBuffer::new_at(config.clone(), Instant::now());
        buffer.append(&(0..32).collect::<Vec<u8>>());
        buffer.flush_at(Instant::now());
        assert_eq!(buffer.len(), 4);

        // Empty flush keeps nothing
        let mut buffer = AudioBuffer::new_at(config, Instant::now());
        assert!(buffer.flush().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_default_config_matches_pcm_settings() {
        let config = AudioBufferConfig::default();
        assert_eq!(config.flush_threshold_bytes, 8000);
        assert_eq!(config.max_window_bytes, 160_000);
        assert_eq!(config.chunk_size_bytes, 4096);
        assert_eq!(config.min_flush_interval, Duration::from_millis(500));
    }
}

//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__HOST, APP_AUDIO__MAX_WINDOW_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Durations:
//! Flush thresholds and the sliding window are configured in milliseconds of
//! audio. Byte sizes are derived from the PCM format in [`AudioSettings`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Groups: server, audio, session, performance, translator. The runtime
/// update endpoint patches one group at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub session: SessionSettings,
    pub performance: PerformanceConfig,
    pub translator: TranslatorConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PCM format and flush policy for participant audio.
///
/// ## Fields:
/// - `sample_rate`, `channels`, `bit_depth`: the raw PCM format clients send
/// - `chunk_size_bytes`: the client's chunking cadence; caps the retained tail
/// - `flush_threshold_ms`: minimum buffered speech before a flush may fire
/// - `min_flush_interval_ms`: minimum time between two flushes
/// - `max_window_ms`: sliding window bound; older audio is dropped
/// - `wrap_wav`: wrap translated audio in a WAVE container before sending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub chunk_size_bytes: usize,
    pub flush_threshold_ms: u32,
    pub min_flush_interval_ms: u64,
    pub max_window_ms: u32,
    pub wrap_wav: bool,
}

/// Connection liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Language used when the client omits `target_lang`
    pub default_target_lang: String,

    /// Idle time after which the server sends a keepalive ping
    pub ping_interval_secs: u64,

    /// Idle time after which the session is force-closed
    pub idle_timeout_secs: u64,

    /// Consecutive malformed frames tolerated before closing
    pub max_protocol_errors: u32,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - `translation_workers` bounds concurrent Translator invocations across all
///   rooms. Size it to what the translation backend can actually run in parallel.
/// - `max_concurrent_sessions` rejects new connections past the limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub translation_workers: usize,
}

/// External translation service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Base URL of the translation service (e.g. "http://127.0.0.1:9000")
    pub endpoint: String,

    /// Per-request timeout for translate calls
    pub request_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioSettings::default(),
            session: SessionSettings::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                translation_workers: 4,
            },
            translator: TranslatorConfig {
                endpoint: "http://127.0.0.1:9000".to_string(),
                request_timeout_ms: 30_000,
            },
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,          // 16kHz - what speech models expect
            channels: 1,                 // Mono audio
            bit_depth: 16,               // 16-bit signed PCM
            chunk_size_bytes: 4096,      // Client sends 2048 samples per frame
            flush_threshold_ms: 250,     // 8000 bytes at 16kHz mono 16-bit
            min_flush_interval_ms: 500,
            max_window_ms: 5000,         // Keep at most 5 seconds of speech
            wrap_wav: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_target_lang: "en".to_string(),
            ping_interval_secs: 10,
            idle_timeout_secs: 30,
            max_protocol_errors: 5,
        }
    }
}

impl AudioSettings {
    /// Bytes of PCM produced per second of audio.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Convert a duration in milliseconds of audio into a byte count.
    ///
    /// The result is rounded down to a whole frame so a window never splits a sample.
    pub fn ms_to_bytes(&self, ms: u32) -> usize {
        let frame = self.block_align();
        let raw = self.bytes_per_second() * ms as usize / 1000;
        if frame == 0 {
            raw
        } else {
            raw - raw % frame
        }
    }

    /// Bytes per sample frame (all channels).
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn flush_threshold_bytes(&self) -> usize {
        self.ms_to_bytes(self.flush_threshold_ms)
    }

    pub fn max_window_bytes(&self) -> usize {
        self.ms_to_bytes(self.max_window_ms)
    }

    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }
}

impl SessionSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_TRANSLATOR__ENDPOINT=http://translator:9000`: Point at another service
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The PCM format is usable (non-zero rate/channels, 16-bit samples)
    /// - The flush threshold fits inside the sliding window
    /// - The keepalive ping fires before the hard idle timeout
    /// - At least one session and one translation worker are allowed
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM is supported, got {}", self.audio.bit_depth));
        }

        if self.audio.chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("Chunk size must be greater than 0"));
        }

        if self.audio.flush_threshold_bytes() == 0 {
            return Err(anyhow::anyhow!("Flush threshold must cover at least one sample"));
        }

        if self.audio.flush_threshold_ms > self.audio.max_window_ms {
            return Err(anyhow::anyhow!(
                "Flush threshold ({}ms) cannot exceed the audio window ({}ms)",
                self.audio.flush_threshold_ms,
                self.audio.max_window_ms
            ));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.session.ping_interval_secs == 0
            || self.session.ping_interval_secs >= self.session.idle_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Ping interval ({}s) must be non-zero and shorter than the idle timeout ({}s)",
                self.session.ping_interval_secs,
                self.session.idle_timeout_secs
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.translation_workers == 0 {
            return Err(anyhow::anyhow!("Translation workers must be greater than 0"));
        }

        if self.translator.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Translator endpoint cannot be empty"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only fields present in the JSON are changed, e.g.
    /// `{"session": {"idle_timeout_secs": 60}}` changes just the idle timeout.
    /// Changes apply to sessions that connect after the update.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(v) = audio.get("flush_threshold_ms").and_then(|v| v.as_u64()) {
                self.audio.flush_threshold_ms = v as u32;
            }
            if let Some(v) = audio.get("min_flush_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.min_flush_interval_ms = v;
            }
            if let Some(v) = audio.get("max_window_ms").and_then(|v| v.as_u64()) {
                self.audio.max_window_ms = v as u32;
            }
            if let Some(v) = audio.get("wrap_wav").and_then(|v| v.as_bool()) {
                self.audio.wrap_wav = v;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(v) = session.get("default_target_lang").and_then(|v| v.as_str()) {
                self.session.default_target_lang = v.to_string();
            }
            if let Some(v) = session.get("ping_interval_secs").and_then(|v| v.as_u64()) {
                self.session.ping_interval_secs = v;
            }
            if let Some(v) = session.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.idle_timeout_secs = v;
            }
            if let Some(v) = session.get("max_protocol_errors").and_then(|v| v.as_u64()) {
                self.session.max_protocol_errors = v as u32;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

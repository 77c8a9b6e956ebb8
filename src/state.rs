//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration; sessions copy what they
//!   need when they open, so updates apply to new sessions only
//! - **metrics**: request counters, per-endpoint timings, active sessions
//! - **registry**: the room map every session joins and leaves
//! - **dispatcher**: the translation worker pool flushes are sent to
//!
//! ## Arc<RwLock<T>> Pattern
//! Config and metrics are read far more often than written, so both sit
//! behind a reader-writer lock. The room registry and the dispatcher carry
//! their own synchronization and are shared as plain `Arc`s.

use crate::config::AppConfig;
use crate::room::RoomRegistry;
use crate::translation::{FlushDispatcher, TranslationStatsSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP and session metrics, updated by middleware and actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub registry: Arc<RoomRegistry>,

    pub dispatcher: Arc<FlushDispatcher>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across requests and sessions.
///
/// ## Fields:
/// - **request_count** / **error_count**: HTTP load and reliability
/// - **active_sessions**: open WebSocket participants, checked against
///   `max_concurrent_sessions` on every join
/// - **sessions_opened** / **sessions_rejected**: connection churn
/// - **endpoint_metrics**: per-endpoint timings
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub sessions_opened: u64,
    pub sessions_rejected: u64,
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time in milliseconds
    pub total_duration_ms: u64,

    pub error_count: u64,
}

/// Room and translation figures read live from the relay core.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelaySnapshot {
    pub rooms: usize,
    pub translations: TranslationStatsSnapshot,
}

impl AppState {
    pub fn new(config: AppConfig, registry: Arc<RoomRegistry>, dispatcher: Arc<FlushDispatcher>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            dispatcher,
            start_time: Instant::now(),
        }
    }

    // Counters and config stay usable even if a writer panicked mid-update
    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint, we create a new EndpointMetric with default values.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot. Returns false when `max_concurrent_sessions`
    /// participants are already connected.
    pub fn try_open_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= max_sessions {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.sessions_opened += 1;
        true
    }

    /// Release a session slot. Never goes below zero.
    pub fn close_session(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn relay_snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            rooms: self.registry.room_count(),
            translations: self.dispatcher.stats(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::PcmFormat;
    use crate::translation::{TranslationError, TranslationResult, Translator};

    /// Answers every call with an empty transcript.
    pub(crate) struct SilentTranslator;

    impl Translator for SilentTranslator {
        fn translate(
            &self,
            _audio: &[u8],
            _target_lang: &str,
            _source_lang: Option<&str>,
        ) -> Result<TranslationResult, TranslationError> {
            Ok(TranslationResult::default())
        }
    }

    pub(crate) fn test_state(config: AppConfig) -> AppState {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Arc::new(FlushDispatcher::new(
            Arc::new(SilentTranslator),
            registry.clone(),
            config.performance.translation_workers,
            PcmFormat::from_settings(&config.audio),
            config.audio.wrap_wav,
        ));
        AppState::new(config, registry, dispatcher)
    }

    #[test]
    fn test_session_slots_are_bounded() {
        let state = test_state(AppConfig::default());

        assert!(state.try_open_session(2));
        assert!(state.try_open_session(2));
        assert!(!state.try_open_session(2));

        state.close_session();
        assert!(state.try_open_session(2));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.sessions_opened, 3);
        assert_eq!(metrics.sessions_rejected, 1);

        for _ in 0..5 {
            state.close_session();
        }
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert!((health.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((health.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = test_state(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }
}

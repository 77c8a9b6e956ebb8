//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: returned by HTTP handlers and converted into JSON error
//!   responses through actix-web's `ResponseError` trait.
//! - [`RelayError`]: raised inside the relay core (sessions, rooms, delivery).
//!   These never become HTTP responses; the session and room layers decide
//!   whether to log, skip, evict or close.
//!
//! ## Propagation policy:
//! A failure in one participant's pipeline never crosses into another
//! participant's delivery path. Delivery errors are collected per recipient,
//! translation failures mean "no output this cycle", and only startup errors
//! (bad config, translator unreachable) are fatal.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Capacity reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Room room-1a2b3c does not exist",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the relay core.
///
/// ## Taxonomy:
/// - **Connection**: a recipient's connection refused a delivery. Isolated per
///   recipient; the dead session is removed from its room.
/// - **Protocol**: a malformed frame. Logged and ignored unless repeated.
/// - **Translation**: the Translator failed or produced nothing. No output this cycle.
/// - **Timeout**: the session was idle past its limit. Graceful close.
/// - **Membership**: a join that would break room invariants.
/// - **InvalidTransition**: a session lifecycle transition that is not allowed.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    Connection(String),
    Protocol(String),
    Translation(String),
    Timeout { idle_secs: u64 },
    Membership(String),
    InvalidTransition { from: &'static str, to: &'static str },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Translation(msg) => write!(f, "Translation failure: {}", msg),
            RelayError::Timeout { idle_secs } => {
                write!(f, "Session idle for {}s, timing out", idle_secs)
            }
            RelayError::Membership(msg) => write!(f, "Membership error: {}", msg),
            RelayError::InvalidTransition { from, to } => {
                write!(f, "Cannot move session from {} to {}", from, to)
            }
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    /// Short machine-readable code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "connection_error",
            RelayError::Protocol(_) => "invalid_message",
            RelayError::Translation(_) => "translation_failed",
            RelayError::Timeout { .. } => "idle_timeout",
            RelayError::Membership(_) => "membership_error",
            RelayError::InvalidTransition { .. } => "invalid_state",
        }
    }
}

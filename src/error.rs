//! # Error Handling
//!
//! Three error families live here, one per surface of the service:
//!
//! - **AppError**: returned by HTTP handlers, converted to JSON responses
//! - **VoiceError**: per-session failures, surfaced to the client as `error` events
//! - **ProviderError**: failures of an external collaborator (STT, TTS, LLM, alerts)
//!
//! ## Key Rust Concepts:
//! - **Enums for Error Types**: each variant is one failure scenario, pattern matched by callers
//! - **Display trait**: human-readable formatting, written by hand for every type
//! - **From trait**: lets `?` convert library errors into our own types

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    NotFound(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 'abc' not found",
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
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
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

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

/// Failures scoped to one voice session.
///
/// ## Propagation:
/// Only `AuthTimeout`, `AuthRequired`, `CapacityReached`, `SessionConflict` and `IdleTimeout`
/// end a session. Every other variant is reported to the client as an
/// `error` event and the session returns to `Listening`.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// No init frame arrived before the deadline
    AuthTimeout,
    /// Init frame lacked a token while tokens are required
    AuthRequired,
    /// Speech recognition failed or produced nothing usable
    TranscriptionFailed(String),
    /// The risk classifier failed and the pattern scan was used instead
    ClassificationDegraded(String),
    /// The reply generator failed and the fallback reply was used instead
    GenerationFailed(String),
    /// Audio for one chunk could not be produced
    SynthesisFailed { chunk_index: usize, reason: String },
    /// A frame that makes no sense in the current state
    ProtocolViolation(String),
    SessionNotFound(String),
    /// The registry is at its admission limit
    CapacityReached(usize),
    /// The session id is already driven by another live connection
    SessionConflict(String),
    /// No frame arrived within the idle timeout while listening
    IdleTimeout,
}

impl VoiceError {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::AuthTimeout => "auth_timeout",
            VoiceError::AuthRequired => "auth_required",
            VoiceError::TranscriptionFailed(_) => "transcription_failed",
            VoiceError::ClassificationDegraded(_) => "classification_degraded",
            VoiceError::GenerationFailed(_) => "generation_failed",
            VoiceError::SynthesisFailed { .. } => "synthesis_failed",
            VoiceError::ProtocolViolation(_) => "protocol_violation",
            VoiceError::SessionNotFound(_) => "session_not_found",
            VoiceError::CapacityReached(_) => "capacity_reached",
            VoiceError::SessionConflict(_) => "session_conflict",
            VoiceError::IdleTimeout => "idle_timeout",
        }
    }

    /// Message shown to the user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::AuthTimeout => "Authentication timeout".to_string(),
            VoiceError::AuthRequired => "Authentication token required".to_string(),
            VoiceError::TranscriptionFailed(_) => "Speech recognition failed".to_string(),
            VoiceError::ClassificationDegraded(_) => "Risk classification degraded".to_string(),
            VoiceError::GenerationFailed(_) => "Reply generation failed".to_string(),
            VoiceError::SynthesisFailed { chunk_index, .. } => {
                format!("Voice synthesis failed for part {}", chunk_index + 1)
            }
            VoiceError::ProtocolViolation(msg) => msg.clone(),
            VoiceError::SessionNotFound(id) => format!("Session '{}' not found", id),
            VoiceError::CapacityReached(_) => "Server is at capacity, please retry shortly".to_string(),
            VoiceError::SessionConflict(_) => "Session is already active on another connection".to_string(),
            VoiceError::IdleTimeout => "Session closed after a period of inactivity".to_string(),
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::AuthTimeout => write!(f, "Authentication timeout"),
            VoiceError::AuthRequired => write!(f, "Authentication token required"),
            VoiceError::TranscriptionFailed(msg) => write!(f, "Transcription failed: {}", msg),
            VoiceError::ClassificationDegraded(msg) => {
                write!(f, "Classification degraded to pattern scan: {}", msg)
            }
            VoiceError::GenerationFailed(msg) => write!(f, "Reply generation failed: {}", msg),
            VoiceError::SynthesisFailed { chunk_index, reason } => {
                write!(f, "Synthesis failed for chunk {}: {}", chunk_index, reason)
            }
            VoiceError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            VoiceError::SessionNotFound(id) => write!(f, "Session '{}' not found", id),
            VoiceError::CapacityReached(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
            VoiceError::SessionConflict(id) => {
                write!(f, "Session '{}' is already owned by another connection", id)
            }
            VoiceError::IdleTimeout => write!(f, "Session idle timeout"),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Failures reported by an external collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The call exceeded its deadline
    Timeout,
    /// Transport failure or non-success HTTP status
    Http(String),
    /// The collaborator answered with something we could not use
    Malformed(String),
    /// The capability is not configured in this deployment
    Unavailable(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "call timed out"),
            ProviderError::Http(msg) => write!(f, "http error: {}", msg),
            ProviderError::Malformed(msg) => write!(f, "malformed response: {}", msg),
            ProviderError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

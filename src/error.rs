//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: failures on the HTTP surface (config endpoints, webhook,
//!   WebSocket upgrade), converted into JSON responses via `ResponseError`
//! - **RelayError**: failures inside one bridged call. These never leave the
//!   session: they are logged, and depending on the kind either the offending
//!   frame is dropped or the session is torn down
//!
//! ## Relay Error Taxonomy:
//! | Kind | Effect |
//! |------|--------|
//! | `MalformedFrame`, `InvalidPayload` | drop the frame, keep going |
//! | `MisalignedChunk`, `UnsupportedRate` | drop the audio chunk, keep going |
//! | `Transport` | close both connections |
//! | `HandshakeTimeout` | close both connections |

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: Concurrent call limit reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// User input failed validation rules
    ValidationError(String),

    /// No capacity for another call right now
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent calls (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
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

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Errors raised while relaying one call.
#[derive(Debug)]
pub enum RelayError {
    /// A JSON frame that could not be parsed or lacks required fields
    MalformedFrame(String),

    /// A frame whose audio payload is not valid base64
    InvalidPayload(String),

    /// Linear PCM whose byte length is not a multiple of the sample width
    MisalignedChunk { len: usize },

    /// Two rates that are not related by an integer factor
    UnsupportedRate { from: u32, to: u32 },

    /// Socket-level failure on either connection
    Transport(String),

    /// The audio peer never acknowledged its setup
    HandshakeTimeout { waited_ms: u64 },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            RelayError::InvalidPayload(msg) => write!(f, "Invalid audio payload: {}", msg),
            RelayError::MisalignedChunk { len } => {
                write!(f, "Audio chunk of {} bytes is not a whole number of 16-bit samples", len)
            }
            RelayError::UnsupportedRate { from, to } => {
                write!(f, "Cannot resample {}Hz to {}Hz", from, to)
            }
            RelayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RelayError::HandshakeTimeout { waited_ms } => {
                write!(f, "Audio peer not ready after {}ms", waited_ms)
            }
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    /// Whether this error ends the session rather than just the current frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::HandshakeTimeout { .. })
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedFrame(err.to_string())
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(err: base64::DecodeError) -> Self {
        RelayError::InvalidPayload(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

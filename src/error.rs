//! # Error Handling
//!
//! This module defines the two error families of the relay and how they reach the outside world.
//!
//! ## Two audiences, two types:
//! - **AppError**: errors of the HTTP surface (`/api/v1/*`, the WebSocket upgrade). They become
//!   JSON responses through actix-web's `ResponseError` trait.
//! - **RelayError**: errors inside a live voice session. They never become HTTP responses;
//!   the session turns each one into at most one `error` control message and a log line.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Data**: Each variant can hold additional information (provider name, reason)
//! - **Pattern matching**: Use `match` to decide how each failure is surfaced
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (used by `?`)
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **thiserror**: Derives `Display` and `std::error::Error` from `#[error(...)]` attributes
//!
//! ## Session error policy:
//! | Variant | Reported to peer | Session afterwards |
//! |---|---|---|
//! | `Init` | yes | stays usable, `start` may be retried |
//! | `ProviderStream` | yes | current cycle aborted, back to listening |
//! | `Transport` | no (peer is gone) | closed |
//! | `MalformedMessage` / `InvalidAudio` | no, logged only | unchanged |

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors returned by the HTTP handlers.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The relay is at its session limit (503 errors)
///
/// ## Usage Example:
/// ```rust
/// use voice_relay_backend::error::AppError;
/// let err = AppError::BadRequest("Invalid JSON".to_string());
/// assert!(err.to_string().contains("Invalid JSON"));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Capacity exhausted; the client should retry later
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "Session limit reached (10 active)",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Failures inside a live voice session.
///
/// `provider` is the adapter's display name (for example "Gladia STT") so that the
/// peer-facing message tells the user which stage failed without leaking internals.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A provider session could not be created (missing credentials, rejected config, network)
    #[error("{provider} could not start: {reason}")]
    Init { provider: &'static str, reason: String },

    /// A provider stream failed after it started
    #[error("{provider} stream failed: {reason}")]
    ProviderStream { provider: &'static str, reason: String },

    /// The client connection failed or closed
    #[error("transport failure: {0}")]
    Transport(String),

    /// A text frame that is not a known control message
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// A binary frame that is not PCM16
    #[error("invalid audio frame: {0}")]
    InvalidAudio(String),

    /// The client's outbound buffer is full
    #[error("outbound buffer full ({capacity} messages pending)")]
    Backpressure { capacity: usize },
}

impl RelayError {
    pub fn init(provider: &'static str, reason: impl fmt::Display) -> Self {
        RelayError::Init {
            provider,
            reason: reason.to_string(),
        }
    }

    pub fn stream(provider: &'static str, reason: impl fmt::Display) -> Self {
        RelayError::ProviderStream {
            provider,
            reason: reason.to_string(),
        }
    }

    /// The text sent to the peer in an `error` control message.
    ///
    /// ## Returns:
    /// - `Some(message)` for failures the peer must hear about
    /// - `None` for failures that are only logged (malformed input, dead transport)
    pub fn client_message(&self) -> Option<String> {
        match self {
            RelayError::Init { provider, .. } => Some(format!("Failed to initialize {}", provider)),
            RelayError::ProviderStream { provider, reason } => {
                Some(format!("{} failed: {}", provider, reason))
            }
            RelayError::Backpressure { .. } => Some(self.to_string()),
            RelayError::Transport(_)
            | RelayError::MalformedMessage(_)
            | RelayError::InvalidAudio(_) => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

//! # Error Handling
//!
//! HTTP-facing error type and its conversion to responses. Domain errors
//! from the transcription layer are mapped here, and only here, to status
//! codes.
//!
//! ## Error Categories:
//! - **BadRequest**: Client sent an unusable upload (400)
//! - **PayloadTooLarge**: Upload exceeds the configured limit (413)
//! - **ModelUnavailable**: Model files are not present locally (503)
//! - **TranscriptionFailed**: Anything else that went wrong while transcribing (500)
//! - **Internal**: Server-side problems such as a failed temp-file write (500)
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "detail": "Whisper transcription failed.",
//!   "error": {
//!     "type": "transcription_failed",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//! `detail` is the field OpenAI-style clients read the message from.

use crate::transcription::WhisperError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Upload larger than `upload.max_size_mb`
    PayloadTooLarge(String),

    /// Requested model has no files on this host; carries the model name
    ModelUnavailable(String),

    /// Transcription failed; details stay in the server log
    TranscriptionFailed,

    /// Internal server errors (I/O failures and the like)
    Internal(String),
}

impl AppError {
    /// Map a transcription failure for `model` to its HTTP error.
    pub fn from_whisper(error: &WhisperError, model: &str) -> Self {
        match error {
            WhisperError::ModelUnavailable(_) => AppError::ModelUnavailable(model.to_string()),
            _ => AppError::TranscriptionFailed,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::ModelUnavailable(_) => "model_unavailable",
            AppError::TranscriptionFailed => "transcription_failed",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Text shown to clients.
    fn detail(&self) -> String {
        match self {
            AppError::BadRequest(msg) | AppError::PayloadTooLarge(msg) => msg.clone(),
            AppError::ModelUnavailable(model) => format!(
                "Model '{}' is not available locally. Download it before retrying.",
                model
            ),
            AppError::TranscriptionFailed => "Whisper transcription failed.".to_string(),
            AppError::Internal(_) => "Internal server error.".to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ModelUnavailable(model) => write!(f, "Model unavailable: {}", model),
            AppError::TranscriptionFailed => write!(f, "Whisper transcription failed"),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TranscriptionFailed | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "detail": self.detail(),
            "error": {
                "type": self.error_type(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

pub type AppResult<T> = Result<T, AppError>;

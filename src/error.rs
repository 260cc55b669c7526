//! # Error Handling
//!
//! Error taxonomy for the bridge, split by layer:
//!
//! - [`CodecError`]: audio conversion failures (bad framing, unsupported
//!   format pairs). Always a rejection of the input, never fatal.
//! - [`BridgeError`]: session lifecycle failures (duplicate ids, missing
//!   sessions, enqueue after teardown). Dropped frames are *not* errors;
//!   they are counted in the session metrics instead.
//! - [`AppError`]: the HTTP-facing error type. Implements actix's
//!   `ResponseError` so handlers can use `?` and get a JSON error body with
//!   the right status code.
//!
//! Parse errors on the WebSocket and dropped audio frames never surface
//! here; they are counted per-link/per-session and the stream continues.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::audio::format::AudioFormat;

/// Errors raised by the stateless audio codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// PCM16 frames must contain whole little-endian samples.
    #[error("PCM data length must be even (16-bit samples), got {len} bytes")]
    OddLength { len: usize },

    /// Only Telephony ↔ Pipeline conversions are supported.
    #[error("unsupported conversion: {from} -> {to}")]
    UnsupportedConversion { from: AudioFormat, to: AudioFormat },

    /// The mixer needs at least one input stream.
    #[error("no audio streams provided")]
    EmptyStreamList,

    /// All mixer inputs must be the same length.
    #[error("audio stream length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Errors raised by the bridge registry and session queue pair.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Enqueue or subscribe attempted after the session was torn down.
    #[error("session closed: {0}")]
    Closed(String),

    /// A provider link is already bound to this session.
    #[error("session already has a bound link: {0}")]
    AlreadyBound(String),
}

/// HTTP-facing application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

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

/// Bridge failures map onto HTTP status codes at the webhook boundary:
/// missing sessions become 404s, everything else is a server fault.
impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::SessionNotFound(id) => AppError::NotFound(format!("session {}", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

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

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{PIPELINE, TELEPHONY};

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::OddLength { len: 15 };
        assert!(err.to_string().contains("15"));

        let err = CodecError::UnsupportedConversion {
            from: PIPELINE,
            to: TELEPHONY,
        };
        assert!(err.to_string().contains("16000Hz"));
        assert!(err.to_string().contains("mulaw"));
    }

    #[test]
    fn test_bridge_error_to_http_status() {
        let not_found: AppError = BridgeError::SessionNotFound("abc".into()).into();
        assert!(matches!(not_found, AppError::NotFound(_)));

        let duplicate: AppError = BridgeError::DuplicateSession("abc".into()).into();
        assert!(matches!(duplicate, AppError::Internal(_)));
    }

    #[test]
    fn test_error_response_bodies() {
        let resp = AppError::NotFound("session xyz".into()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

        let resp = AppError::BadRequest("missing CallSid".into()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}

//! Admission errors and session close reasons.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Admission errors
// ---------------------------------------------------------------------------

/// Why a request was rejected before reaching a session.
///
/// Rendered to the client as JSON `{"code": N, "message": "..."}` with
/// status 400, or 403 for `Forbidden`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    UnknownTransport,
    UnknownSid,
    BadHandshakeMethod,
    BadRequest,
    Forbidden(Option<String>),
    UnsupportedProtocolVersion,
}

#[derive(Debug, Serialize)]
struct EngineErrorBody {
    code: u8,
    message: String,
}

impl EngineError {
    pub fn code(&self) -> u8 {
        match self {
            Self::UnknownTransport => 0,
            Self::UnknownSid => 1,
            Self::BadHandshakeMethod => 2,
            Self::BadRequest => 3,
            Self::Forbidden(_) => 4,
            Self::UnsupportedProtocolVersion => 5,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::UnknownTransport => "Transport unknown",
            Self::UnknownSid => "Session ID unknown",
            Self::BadHandshakeMethod => "Bad handshake method",
            Self::BadRequest => "Bad request",
            Self::Forbidden(Some(message)) => message,
            Self::Forbidden(None) => "Forbidden",
            Self::UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for EngineError {}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = EngineErrorBody {
            code: self.code(),
            message: self.message().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

/// Why a session ended. The string forms are part of the public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TransportError,
    TransportClose,
    ForcedClose,
    PingTimeout,
    ParseError,
    ServerShuttingDown,
    ForcedDisconnect,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportError => "transport error",
            Self::TransportClose => "transport close",
            Self::ForcedClose => "forced close",
            Self::PingTimeout => "ping timeout",
            Self::ParseError => "parse error",
            Self::ServerShuttingDown => "server shutting down",
            Self::ForcedDisconnect => "forced disconnect",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_table() {
        assert_eq!(EngineError::UnknownTransport.code(), 0);
        assert_eq!(EngineError::UnknownSid.code(), 1);
        assert_eq!(EngineError::BadHandshakeMethod.code(), 2);
        assert_eq!(EngineError::BadRequest.code(), 3);
        assert_eq!(EngineError::Forbidden(None).code(), 4);
        assert_eq!(EngineError::UnsupportedProtocolVersion.code(), 5);
    }

    #[test]
    fn forbidden_carries_hook_message() {
        let err = EngineError::Forbidden(Some("origin not allowed".to_string()));
        assert_eq!(err.message(), "origin not allowed");
    }

    #[test]
    fn close_reason_strings_are_stable() {
        assert_eq!(CloseReason::TransportError.as_str(), "transport error");
        assert_eq!(CloseReason::PingTimeout.as_str(), "ping timeout");
        assert_eq!(
            CloseReason::ServerShuttingDown.as_str(),
            "server shutting down"
        );
    }
}

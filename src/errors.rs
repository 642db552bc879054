//! Application error model with HTTP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the HTTP status/body shape the OAuth2-style surface
//! in `spec.md` §7 requires.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers every error kind the bridge can surface at a component boundary.
/// Each variant maps to one row of `spec.md`'s error table.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed request parameters (`invalid_request`)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Client id mismatch or unknown application (`invalid_client`)
    #[error("invalid client: {0}")]
    InvalidClient(String),
    /// Bad/expired/used authorization code, or redirect mismatch (`invalid_grant`)
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    /// `grant_type` is not `authorization_code` (`unsupported_grant_type`)
    #[error("unsupported grant_type: {0}")]
    UnsupportedGrantType(String),
    /// Trial IMAP login failed (`invalid_credentials`)
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// Resource not found (account, mailbox, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// IMAP transport/TLS failure (`upstream_unavailable`)
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Unexpected internal failure (`internal`)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error-kind string used for logging and JSON error bodies.
    ///
    /// Authorization codes and credentials must never be interpolated into
    /// `AppError` message text; only opaque prefixes or kinds are logged.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant(_)
            | Self::UnsupportedGrantType(_)
            | Self::InvalidCredentials(_) => StatusCode::BAD_REQUEST,
            Self::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) | Self::UpstreamUnavailable(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Only the outermost HTTP adapter translates `AppError` into a status code,
/// per the "Exception control flow" design note — every internal boundary
/// keeps passing `AppResult` values around instead.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "request rejected");
        }
        let body = json!({ "success": false, "error": self.kind(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Type alias for fallible return values
///
/// Used by all internal functions that can fail, giving a consistent error
/// type throughout the crate.
pub type AppResult<T> = Result<T, AppError>;

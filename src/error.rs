//! Error types for the relay

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::envelope::ValidationError;
use crate::gateway::auth::AuthError;
use crate::mtls::DecodeError;
use crate::upstream::ForwardError;

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

/// Relay errors
///
/// Every variant maps onto exactly one HTTP status via [`Error::status_code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or missing request fields
    #[error("{0}")]
    Validation(String),

    /// Caller failed authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Server-side configuration prevents serving the request
    #[error("Server misconfigured: {0}")]
    MisconfiguredServer(String),

    /// PKCS#12 bundle could not be decoded
    #[error("Certificate bundle error: {0}")]
    Decode(#[from] DecodeError),

    /// Upstream call timed out
    #[error("Upstream timeout: {0}")]
    ForwardTimeout(String),

    /// TLS handshake or client identity failure against the upstream
    #[error("Upstream TLS failure: {0}")]
    ForwardTls(String),

    /// Any other transport failure against the upstream
    #[error("Upstream transport failure: {0}")]
    ForwardTransport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the caller
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Decode(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ForwardTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ForwardTls(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_)
            | Self::MisconfiguredServer(_)
            | Self::ForwardTransport(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the caller.
    ///
    /// Transport and internal failures are summarized; the full error is
    /// logged server-side instead.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::ForwardTransport(_) => "Upstream request failed".to_string(),
            Self::Io(_) | Self::Internal(_) | Self::Config(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(msg) => Self::Unauthorized(msg),
            AuthError::MisconfiguredServer(msg) => Self::MisconfiguredServer(msg),
        }
    }
}

impl From<ForwardError> for Error {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Timeout(msg) => Self::ForwardTimeout(msg),
            ForwardError::Tls(msg) => Self::ForwardTls(msg),
            ForwardError::Transport(msg) => Self::ForwardTransport(msg),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.public_message() }))).into_response()
    }
}

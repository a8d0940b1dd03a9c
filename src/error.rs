use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::credentials::{CredentialError, HandshakeError, RefreshError};

/// Errors the gateway reports to its own callers.
///
/// Business responses from upstream never pass through here; they are
/// relayed verbatim. These cover requests the gateway could not attempt or
/// OAuth operations whose upstream answer is surfaced as an error.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// No account could be resolved; credentials must be set up first.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream rejected request ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Upstream unreachable: {0}")]
    Upstream(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotConfigured(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::NotConfigured(_) => "configuration_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::NotFound(_) => "not_found_error",
            Self::UpstreamRejected { .. } | Self::Upstream(_) => "upstream_error",
            Self::Storage(_) | Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::NotConfigured(_) => Some("not_configured"),
            Self::UpstreamRejected { .. } => Some("upstream_rejected"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(error = %err, "Upstream request failed");
        Self::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        tracing::error!(error = %err, "Credential store error");
        Self::Storage(err.to_string())
    }
}

impl From<RefreshError> for AppError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NoBundle => Self::NotFound(err.to_string()),
            RefreshError::NoRefreshToken
            | RefreshError::RefreshTokenExpired
            | RefreshError::StillValid => Self::BadRequest(err.to_string()),
            RefreshError::UpstreamRejected { status, body } => Self::UpstreamRejected { status, body },
            RefreshError::Network(e) => Self::from(e),
            RefreshError::MalformedResponse(msg) => Self::Upstream(msg),
            RefreshError::Storage(e) => Self::from(e),
        }
    }
}

impl From<HandshakeError> for AppError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::NoAccount => Self::NotConfigured(err.to_string()),
            HandshakeError::UpstreamRejected { status, body } => Self::UpstreamRejected { status, body },
            HandshakeError::Network(e) => Self::from(e),
            HandshakeError::MalformedResponse(msg) => Self::Upstream(msg),
            HandshakeError::Storage(e) => Self::from(e),
            HandshakeError::InvalidUrl(e) => Self::Internal(e.to_string()),
        }
    }
}

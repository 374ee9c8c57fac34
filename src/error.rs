use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Stable failure kinds surfaced by the upstream-access core.
///
/// Only `TransientUpstream`, `RateLimited`, `CredentialInvalid` and
/// `SessionExpired` are ever retried by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientUpstream,
    RateLimited,
    CredentialInvalid,
    SessionExpired,
    MalformedRequest,
    RetriesExhausted,
    StreamInterrupted,
    InvalidUpstreamResponse,
    NoCredentials,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientUpstream => "transient_upstream",
            Self::RateLimited => "rate_limited",
            Self::CredentialInvalid => "credential_invalid",
            Self::SessionExpired => "session_expired",
            Self::MalformedRequest => "malformed_request",
            Self::RetriesExhausted => "retries_exhausted",
            Self::StreamInterrupted => "stream_interrupted",
            Self::InvalidUpstreamResponse => "invalid_upstream_response",
            Self::NoCredentials => "no_credentials",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream
                | Self::RateLimited
                | Self::CredentialInvalid
                | Self::SessionExpired
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::RetriesExhausted | Self::NoCredentials => StatusCode::SERVICE_UNAVAILABLE,
            Self::TransientUpstream
            | Self::CredentialInvalid
            | Self::SessionExpired
            | Self::StreamInterrupted
            | Self::InvalidUpstreamResponse => StatusCode::BAD_GATEWAY,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let error_type = match err.kind {
            ErrorKind::MalformedRequest => "invalid_request_error",
            ErrorKind::RateLimited => "rate_limit_error",
            _ => "upstream_error",
        };
        AppError::new(err.kind.status(), err.kind.as_str(), err.message).with_type(error_type)
    }
}

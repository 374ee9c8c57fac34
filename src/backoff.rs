//! Classifies upstream failures into retry decisions.
//!
//! [`classify`] is pure: the same failure, attempt context and policy always
//! produce the same [`Decision`]. Randomness only enters through [`jittered`],
//! which the dispatcher applies when it actually sleeps.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::upstream::{UpstreamErrorKind, UpstreamFailure};
use axum::http::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    RateLimited,
    Transient,
    CredentialInvalid,
    SessionExpired,
    Malformed,
    InvalidResponse,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::CredentialInvalid => "credential_invalid",
            Self::SessionExpired => "session_expired",
            Self::Malformed => "malformed",
            Self::InvalidResponse => "invalid_response",
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Transient => ErrorKind::TransientUpstream,
            Self::CredentialInvalid => ErrorKind::CredentialInvalid,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::Malformed => ErrorKind::MalformedRequest,
            Self::InvalidResponse => ErrorKind::InvalidUpstreamResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    RetrySameCredential(Duration),
    RetryRotateCredential(Duration),
    Fail(GatewayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Where the failing attempt sits inside one dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// Whether this call already replaced an expired session once.
    pub session_refreshed: bool,
}

pub fn classify(failure: &UpstreamFailure, ctx: &AttemptContext, policy: &RetryPolicy) -> Decision {
    let class = failure_class(failure);
    let retry = match class {
        FailureClass::Malformed => {
            return Decision::Fail(GatewayError::new(
                ErrorKind::MalformedRequest,
                failure.message.clone(),
            ));
        }
        FailureClass::InvalidResponse => {
            return Decision::Fail(GatewayError::new(
                ErrorKind::InvalidUpstreamResponse,
                failure.message.clone(),
            ));
        }
        FailureClass::SessionExpired if ctx.session_refreshed => {
            return Decision::Fail(GatewayError::new(
                ErrorKind::SessionExpired,
                format!("session expired again after refresh: {}", failure.message),
            ));
        }
        FailureClass::RateLimited => Decision::RetryRotateCredential(policy.delay_for(ctx.attempt)),
        FailureClass::Transient => Decision::RetrySameCredential(policy.delay_for(ctx.attempt)),
        FailureClass::CredentialInvalid => Decision::RetryRotateCredential(Duration::ZERO),
        FailureClass::SessionExpired => Decision::RetrySameCredential(Duration::ZERO),
    };

    if ctx.attempt >= policy.max_attempts {
        return Decision::Fail(GatewayError::new(
            ErrorKind::RetriesExhausted,
            format!(
                "gave up after {} attempts, last failure {}: {}",
                ctx.attempt,
                class.as_str(),
                failure.message
            ),
        ));
    }
    retry
}

pub fn failure_class(failure: &UpstreamFailure) -> FailureClass {
    match failure.kind {
        UpstreamErrorKind::Network | UpstreamErrorKind::Timeout => return FailureClass::Transient,
        UpstreamErrorKind::Decode => return FailureClass::InvalidResponse,
        UpstreamErrorKind::Http | UpstreamErrorKind::Declared => {}
    }

    if let Some(class) = failure
        .code
        .as_deref()
        .and_then(|code| declared_class(code, &failure.message))
    {
        return class;
    }

    match failure.status {
        Some(StatusCode::TOO_MANY_REQUESTS) => FailureClass::RateLimited,
        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => FailureClass::CredentialInvalid,
        Some(StatusCode::NOT_FOUND) if mentions_chat(&failure.message) => FailureClass::SessionExpired,
        Some(StatusCode::REQUEST_TIMEOUT) => FailureClass::Transient,
        Some(status) if status.is_server_error() => FailureClass::Transient,
        Some(status) if status.is_client_error() => FailureClass::Malformed,
        Some(_) => FailureClass::Transient,
        // A declared failure with an unrecognized code.
        None => FailureClass::Malformed,
    }
}

fn declared_class(code: &str, message: &str) -> Option<FailureClass> {
    let code = normalize(code);
    if code.contains("ratelimit") || code.contains("toomanyrequests") || code.contains("requestlimit") {
        return Some(FailureClass::RateLimited);
    }
    if code.contains("unauthorized")
        || code.contains("forbidden")
        || code.contains("invalidtoken")
        || code.contains("tokenexpired")
        || code.contains("authfail")
        || code.contains("notlogin")
        || code.contains("loginrequired")
    {
        return Some(FailureClass::CredentialInvalid);
    }
    if code.contains("chatnotfound")
        || code.contains("chatnotexist")
        || code.contains("invalidchatid")
        || code.contains("chatexpired")
        || (code == "notfound" && mentions_chat(message))
    {
        return Some(FailureClass::SessionExpired);
    }
    if code.contains("internalerror")
        || code.contains("servererror")
        || code.contains("serviceunavailable")
        || code.contains("timeout")
        || code.contains("overload")
        || code.contains("busy")
    {
        return Some(FailureClass::Transient);
    }
    None
}

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn mentions_chat(message: &str) -> bool {
    message.to_ascii_lowercase().contains("chat")
}

/// Adds up to `jitter` of random delay. Zero delays stay zero.
pub fn jittered(delay: Duration, jitter: Duration) -> Duration {
    if delay.is_zero() || jitter.is_zero() {
        return delay;
    }
    let extra = rand::random_range(0..=jitter.as_millis() as u64);
    delay + Duration::from_millis(extra)
}

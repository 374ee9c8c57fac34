use crate::error::{AppError, AppResult};
use axum::http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// Static bearer-token gate in front of the public API. Open when no key is configured.
#[derive(Clone, Default)]
pub struct AuthState {
    api_key: Option<Arc<str>>,
}

impl AuthState {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn authorize(&self, headers: &HeaderMap) -> AppResult<()> {
        let Some(expected) = self.api_key.as_deref() else {
            return Ok(());
        };
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .or_else(|| headers.get("x-api-key").and_then(|value| value.to_str().ok()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing auth"))?;
        if token.trim() != expected {
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid api key",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn open_when_no_key_configured() {
        assert!(AuthState::new(None).authorize(&HeaderMap::new()).is_ok());
        assert!(!AuthState::new(Some("  ".to_string())).is_enabled());
    }

    #[test]
    fn bearer_or_x_api_key_must_match() {
        let auth = AuthState::new(Some("sk-local".to_string()));
        let mut headers = HeaderMap::new();
        assert_eq!(auth.authorize(&headers).unwrap_err().status, StatusCode::UNAUTHORIZED);

        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(auth.authorize(&headers).is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer sk-local"));
        assert!(auth.authorize(&headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-local"));
        assert!(auth.authorize(&headers).is_ok());
    }
}

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Http,
    /// The upstream answered 2xx but the payload reports a failure.
    Declared,
    Decode,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamFailure {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamFailure {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Http, Some(status), message)
    }

    pub fn declared(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Declared, None, message).with_code(Some(code.into()))
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        Self::new(kind, err.status(), err.to_string())
    }
}

/// A fully built upstream call. Produced by the request builder, executed by an [`Upstream`].
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamFailure>> + Send>>;

/// Transport seam between the dispatcher and the upstream service.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn call_json(&self, request: &UpstreamRequest) -> Result<Value, UpstreamFailure>;

    /// Returns the raw event-stream body once the upstream has accepted the call.
    async fn call_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, UpstreamFailure>;
}

pub struct QwenClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl QwenClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            request_timeout,
        }
    }

    fn builder(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let url = join_url(&self.base_url, &request.path);
        let mut req = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }
        req
    }

    async fn open_stream(&self, request: &UpstreamRequest) -> Result<reqwest::Response, UpstreamFailure> {
        let resp = self
            .builder(request)
            .send()
            .await
            .map_err(UpstreamFailure::from_reqwest)?;
        let resp = ensure_success(resp).await?;

        let is_event_stream = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_event_stream {
            return Ok(resp);
        }

        // Errors such as rate limits arrive as a plain JSON body with status 200.
        let status = resp.status();
        let text = resp.text().await.map_err(UpstreamFailure::from_reqwest)?;
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if let Some(failure) = crate::wire::decode::qwen::declared_failure(&value) {
                return Err(failure);
            }
        }
        Err(UpstreamFailure::new(
            UpstreamErrorKind::Decode,
            Some(status),
            format!("expected an event stream, got: {}", truncate(&text, 200)),
        ))
    }
}

#[async_trait::async_trait]
impl Upstream for QwenClient {
    async fn call_json(&self, request: &UpstreamRequest) -> Result<Value, UpstreamFailure> {
        let resp = self
            .builder(request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(UpstreamFailure::from_reqwest)?;
        let resp = ensure_success(resp).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(UpstreamFailure::from_reqwest)?;
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            UpstreamFailure::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
        })?;
        if let Some(failure) = crate::wire::decode::qwen::declared_failure(&value) {
            return Err(failure);
        }
        Ok(value)
    }

    async fn call_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, UpstreamFailure> {
        // Headers, error bodies and declared failures all count against the request timeout.
        let resp = tokio::time::timeout(self.request_timeout, self.open_stream(request))
            .await
            .map_err(|_| {
                UpstreamFailure::new(
                    UpstreamErrorKind::Timeout,
                    None,
                    format!(
                        "upstream did not answer within {}ms",
                        self.request_timeout.as_millis()
                    ),
                )
            })??;
        Ok(Box::pin(
            resp.bytes_stream().map(|item| item.map_err(UpstreamFailure::from_reqwest)),
        ))
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamFailure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let code = extract_error_code(&text);
    Err(UpstreamFailure::http(
        status,
        format!("upstream status {}: {}", status, truncate(&text, 500)),
    )
    .with_code(code))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .or_else(|| value.get("data").and_then(|v| v.get("code")))
        .or_else(|| value.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

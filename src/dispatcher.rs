//! Bounded retry loop around one upstream chat call.
//!
//! ```text
//! BuildRequest ──► Send ──► Success
//!      ▲            │
//!      │            ▼
//!      └──────── Failed ──► Fail
//! ```
//!
//! `Failed` consults [`classify`]. Retry decisions report the failure to the
//! pool before sleeping, so a rotated-away credential is already cooling down
//! when the next one is picked.

use crate::backoff::{AttemptContext, Decision, FailureClass, RetryPolicy, classify, failure_class, jittered};
use crate::config::GatewayConfig;
use crate::credentials::{CredentialLease, CredentialPool};
use crate::error::{ErrorKind, GatewayError};
use crate::relay::{ChunkStream, RelayConfig, relay};
use crate::session::SessionManager;
use crate::upstream::{ByteStream, Upstream, UpstreamFailure, UpstreamRequest};
use crate::wire::decode::qwen::decode_response;
use crate::wire::encode::openai_chat::encode_models;
use crate::wire::encode::qwen::{encode_completion, encode_list_models};
use crate::wire::{ChatRequest, Completion};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One failed attempt inside a dispatch loop.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub credential: usize,
    pub class: FailureClass,
    pub elapsed: Duration,
}

enum State {
    BuildRequest { lease: Option<CredentialLease> },
    Send { lease: CredentialLease, request: UpstreamRequest },
    Failed { lease: CredentialLease, failure: UpstreamFailure },
}

enum Delivered {
    Json(Value),
    Stream(ByteStream),
}

/// What the retry loop does after a failed attempt.
enum Next {
    SameCredential(CredentialLease),
    Rotate,
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    sessions: Arc<SessionManager>,
    upstream: Arc<dyn Upstream>,
    config: Arc<GatewayConfig>,
    policy: RetryPolicy,
    relay_config: RelayConfig,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        sessions: Arc<SessionManager>,
        upstream: Arc<dyn Upstream>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        let relay_config = RelayConfig::from_retry(&config.retry);
        Self {
            pool,
            sessions,
            upstream,
            config,
            policy,
            relay_config,
        }
    }

    pub async fn complete(&self, req: &ChatRequest) -> Result<Completion, GatewayError> {
        match self.dispatch(req, false).await? {
            Delivered::Json(value) => decode_response(&value).map_err(|err| {
                GatewayError::new(
                    ErrorKind::InvalidUpstreamResponse,
                    format!("failed to decode upstream completion: {err}"),
                )
            }),
            Delivered::Stream(_) => Err(GatewayError::new(
                ErrorKind::InvalidUpstreamResponse,
                "upstream streamed a non-streaming call",
            )),
        }
    }

    pub async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        match self.dispatch(req, true).await? {
            Delivered::Stream(body) => Ok(relay(body, self.relay_config)),
            Delivered::Json(_) => Err(GatewayError::new(
                ErrorKind::InvalidUpstreamResponse,
                "upstream answered a streaming call with a json body",
            )),
        }
    }

    async fn dispatch(&self, req: &ChatRequest, stream: bool) -> Result<Delivered, GatewayError> {
        let started = Instant::now();
        let key = req.conversation_key.as_ref();
        let mut ctx = AttemptContext::default();
        let mut attempts: Vec<CallAttempt> = Vec::new();
        // Chat id created during this call, reused while the credential stays the same.
        let mut session: Option<(String, usize)> = None;
        let mut state = State::BuildRequest { lease: None };

        loop {
            state = match state {
                State::BuildRequest { lease } => {
                    ctx.attempt += 1;
                    let lease = match lease {
                        Some(lease) => lease,
                        None => self.pick_credential(req)?,
                    };
                    let reusable = session
                        .as_ref()
                        .filter(|(_, credential)| *credential == lease.index())
                        .map(|(chat_id, _)| chat_id.clone());
                    let chat_id = match reusable {
                        Some(chat_id) => chat_id,
                        None => match self.sessions.get_or_create(key, &lease, req).await {
                            Ok(chat_id) => chat_id,
                            Err(failure) => {
                                state = State::Failed { lease, failure };
                                continue;
                            }
                        },
                    };
                    session = Some((chat_id.clone(), lease.index()));
                    let request = encode_completion(
                        req,
                        stream,
                        &chat_id,
                        &self.config,
                        lease.group(),
                        chrono::Utc::now().timestamp(),
                    );
                    tracing::debug!(
                        attempt = ctx.attempt,
                        credential = lease.index(),
                        chat_id = %chat_id,
                        model = %req.model,
                        mode = req.mode.as_str(),
                        "sending upstream request"
                    );
                    State::Send { lease, request }
                }
                State::Send { lease, request } => {
                    let result = if stream {
                        self.upstream.call_stream(&request).await.map(Delivered::Stream)
                    } else {
                        self.upstream.call_json(&request).await.map(Delivered::Json)
                    };
                    match result {
                        Ok(delivered) => {
                            self.pool.report_success(&lease);
                            metrics::counter!("qwenize_upstream_attempts_total", "outcome" => "success")
                                .increment(1);
                            if !attempts.is_empty() {
                                tracing::info!(
                                    attempts = ctx.attempt,
                                    credential = lease.index(),
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "upstream call succeeded after retries"
                                );
                            }
                            return Ok(delivered);
                        }
                        Err(failure) => State::Failed { lease, failure },
                    }
                }
                State::Failed { lease, failure } => {
                    let class = failure_class(&failure);
                    attempts.push(CallAttempt {
                        credential: lease.index(),
                        class,
                        elapsed: started.elapsed(),
                    });
                    match self.settle(lease, &failure, &mut ctx).await {
                        Ok(Next::SameCredential(lease)) => {
                            if class == FailureClass::SessionExpired {
                                if let Some(key) = key {
                                    self.sessions.invalidate(key);
                                }
                                session = None;
                                ctx.session_refreshed = true;
                            }
                            State::BuildRequest { lease: Some(lease) }
                        }
                        Ok(Next::Rotate) => {
                            session = None;
                            State::BuildRequest { lease: None }
                        }
                        Err(err) => {
                            tracing::warn!(
                                kind = err.kind.as_str(),
                                attempts = ?attempts,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "upstream call failed: {}",
                                err.message
                            );
                            return Err(err);
                        }
                    }
                }
            };
        }
    }

    /// Upstream model list, through the same credential rotation as chat calls.
    pub async fn list_models(&self) -> Result<Value, GatewayError> {
        let mut ctx = AttemptContext::default();
        let mut next_lease: Option<CredentialLease> = None;
        loop {
            ctx.attempt += 1;
            let lease = match next_lease.take() {
                Some(lease) => lease,
                None => self.acquire()?,
            };
            let request = encode_list_models(&self.config, lease.group());
            match self.upstream.call_json(&request).await {
                Ok(value) => {
                    self.pool.report_success(&lease);
                    return Ok(encode_models(&value, &self.config.thinking_models));
                }
                Err(failure) => match self.settle(lease, &failure, &mut ctx).await? {
                    Next::SameCredential(lease) => next_lease = Some(lease),
                    Next::Rotate => {}
                },
            }
        }
    }

    /// Classifies a failure, reports it to the pool and sleeps out the backoff.
    async fn settle(
        &self,
        lease: CredentialLease,
        failure: &UpstreamFailure,
        ctx: &mut AttemptContext,
    ) -> Result<Next, GatewayError> {
        let class = failure_class(failure);
        metrics::counter!("qwenize_upstream_attempts_total", "outcome" => class.as_str()).increment(1);
        self.pool.report_failure(&lease, class);
        let (next, delay) = match classify(failure, ctx, &self.policy) {
            Decision::Fail(err) => return Err(err),
            Decision::RetrySameCredential(delay) => (Next::SameCredential(lease.clone()), delay),
            Decision::RetryRotateCredential(delay) => (Next::Rotate, delay),
        };
        let delay = jittered(delay, self.policy.jitter);
        tracing::info!(
            attempt = ctx.attempt,
            credential = lease.index(),
            class = class.as_str(),
            rotate = matches!(next, Next::Rotate),
            delay_ms = delay.as_millis() as u64,
            "retrying upstream call: {}",
            failure.message
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(next)
    }

    /// Keeps a keyed conversation on its bound credential while that credential is healthy.
    fn pick_credential(&self, req: &ChatRequest) -> Result<CredentialLease, GatewayError> {
        if let Some(lease) = req
            .conversation_key
            .as_ref()
            .and_then(|key| self.sessions.bound_credential(key))
            .and_then(|idx| self.pool.lease(idx))
        {
            return Ok(lease);
        }
        self.acquire()
    }

    fn acquire(&self) -> Result<CredentialLease, GatewayError> {
        self.pool.acquire().ok_or_else(|| {
            GatewayError::new(ErrorKind::NoCredentials, "no upstream credentials configured")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialGroup, RetryConfig};
    use crate::wire::{ChatMode, ConversationKey, Message, Role, StreamEnd};
    use axum::http::StatusCode;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted upstream: session creations always succeed, completions pop
    /// the next scripted outcome and default to success.
    #[derive(Default)]
    struct ScriptedUpstream {
        script: Mutex<VecDeque<Result<(), UpstreamFailure>>>,
        created: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedUpstream {
        fn with_script(script: Vec<Result<(), UpstreamFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn created(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn next_outcome(&self, request: &UpstreamRequest) -> Result<(), UpstreamFailure> {
            let token = request
                .header_value("authorization")
                .unwrap_or_default()
                .trim_start_matches("Bearer ")
                .to_string();
            let chat_id = request.query_value("chat_id").unwrap_or_default().to_string();
            self.sent.lock().unwrap().push((token, chat_id));
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    #[async_trait::async_trait]
    impl Upstream for ScriptedUpstream {
        async fn call_json(&self, request: &UpstreamRequest) -> Result<Value, UpstreamFailure> {
            if request.path == "chats/new" {
                let mut created = self.created.lock().unwrap();
                let id = format!("chat-{}", created.len() + 1);
                created.push(id.clone());
                return Ok(json!({"success": true, "data": {"id": id}}));
            }
            if request.path == "models" {
                return Ok(json!({"data": [{"id": "qwen-max"}]}));
            }
            self.next_outcome(request)?;
            Ok(json!({
                "choices": [{"message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1}
            }))
        }

        async fn call_stream(&self, request: &UpstreamRequest) -> Result<ByteStream, UpstreamFailure> {
            self.next_outcome(request)?;
            let events = vec![
                r#"{"choices":[{"delta":{"content":"po","phase":"answer","status":"typing"}}]}"#,
                r#"{"choices":[{"delta":{"content":"ng","phase":"answer","status":"typing"}}]}"#,
                "[DONE]",
            ];
            Ok(Box::pin(futures_util::stream::iter(
                events
                    .into_iter()
                    .map(|data| Ok(Bytes::from(format!("data: {data}\n\n")))),
            )))
        }
    }

    fn gateway_config(tokens: &[&str], max_attempts: u32) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            credential_groups: tokens.iter().map(|t| CredentialGroup::new(*t)).collect(),
            retry: RetryConfig {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 4,
                jitter_ms: 0,
                ..RetryConfig::default()
            },
            ..GatewayConfig::default()
        })
    }

    fn dispatcher(upstream: Arc<ScriptedUpstream>, config: Arc<GatewayConfig>) -> (Dispatcher, Arc<CredentialPool>, Arc<SessionManager>) {
        let pool = Arc::new(CredentialPool::new(
            config.credential_groups.clone(),
            config.retry.rate_limit_cooldown(),
            config.retry.auth_cooldown(),
        ));
        let sessions = Arc::new(SessionManager::new(upstream.clone(), config.clone()));
        let dispatcher = Dispatcher::new(pool.clone(), sessions.clone(), upstream, config);
        (dispatcher, pool, sessions)
    }

    fn request(key: Option<&str>) -> ChatRequest {
        ChatRequest {
            requested_model: "qwen-max".to_string(),
            model: "qwen-max".to_string(),
            mode: ChatMode::Normal,
            messages: vec![Message {
                role: Role::User,
                content: "ping".to_string(),
            }],
            stream: false,
            conversation_key: key.and_then(ConversationKey::new),
        }
    }

    fn http(status: StatusCode) -> UpstreamFailure {
        UpstreamFailure::http(status, format!("upstream status {status}"))
    }

    #[tokio::test]
    async fn plain_call_creates_one_session() {
        let upstream = ScriptedUpstream::with_script(vec![]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a"], 4));
        let completion = dispatcher.complete(&request(None)).await.unwrap();
        assert_eq!(completion.content, "pong");
        assert_eq!(completion.usage.prompt_tokens, 5);
        assert_eq!(upstream.created(), 1);
        assert_eq!(upstream.sent(), vec![("a".to_string(), "chat-1".to_string())]);
    }

    #[tokio::test]
    async fn transient_retries_reuse_the_session() {
        let upstream = ScriptedUpstream::with_script(vec![
            Err(http(StatusCode::BAD_GATEWAY)),
            Err(UpstreamFailure::new(crate::upstream::UpstreamErrorKind::Timeout, None, "timeout")),
            Err(http(StatusCode::SERVICE_UNAVAILABLE)),
        ]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a", "b"], 4));
        dispatcher.complete(&request(None)).await.unwrap();
        assert_eq!(upstream.created(), 1);
        let sent = upstream.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|(token, chat)| token == "a" && chat == "chat-1"));
    }

    #[tokio::test]
    async fn rate_limit_rotates_after_marking_unhealthy() {
        let upstream = ScriptedUpstream::with_script(vec![Err(http(StatusCode::TOO_MANY_REQUESTS))]);
        let (dispatcher, pool, _) = dispatcher(upstream.clone(), gateway_config(&["a", "b"], 4));
        dispatcher.complete(&request(None)).await.unwrap();
        let sent = upstream.sent();
        assert_eq!(sent[0], ("a".to_string(), "chat-1".to_string()));
        assert_eq!(sent[1], ("b".to_string(), "chat-2".to_string()));
        let snapshot = pool.snapshot();
        assert!(!snapshot[0].healthy);
        assert!(snapshot[1].healthy);
    }

    #[tokio::test]
    async fn expired_session_is_replaced_once() {
        let expired = || UpstreamFailure::declared("Not_Found", "chat not exist");
        let upstream = ScriptedUpstream::with_script(vec![Ok(()), Err(expired())]);
        let (dispatcher, _, sessions) = dispatcher(upstream.clone(), gateway_config(&["a"], 4));
        let key = ConversationKey::new("conv-1").unwrap();

        dispatcher.complete(&request(Some("conv-1"))).await.unwrap();
        assert_eq!(sessions.get(&key).unwrap().chat_id, "chat-1");

        dispatcher.complete(&request(Some("conv-1"))).await.unwrap();
        assert_eq!(upstream.created(), 2);
        assert_eq!(sessions.get(&key).unwrap().chat_id, "chat-2");
        let chats: Vec<String> = upstream.sent().into_iter().map(|(_, chat)| chat).collect();
        assert_eq!(chats, vec!["chat-1", "chat-1", "chat-2"]);
    }

    #[tokio::test]
    async fn repeated_expiry_fails_as_session_expired() {
        let expired = || UpstreamFailure::declared("chat_not_found", "gone");
        let upstream = ScriptedUpstream::with_script(vec![Err(expired()), Err(expired())]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a"], 4));
        let err = dispatcher.complete(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionExpired);
        assert_eq!(upstream.created(), 2);
    }

    #[tokio::test]
    async fn malformed_request_is_not_retried() {
        let upstream = ScriptedUpstream::with_script(vec![Err(http(StatusCode::BAD_REQUEST))]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a", "b"], 4));
        let err = dispatcher.complete(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedRequest);
        assert_eq!(upstream.sent().len(), 1);
    }

    #[tokio::test]
    async fn attempt_cap_yields_retries_exhausted() {
        let upstream = ScriptedUpstream::with_script(
            (0..5).map(|_| Err(http(StatusCode::INTERNAL_SERVER_ERROR))).collect(),
        );
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a"], 3));
        let err = dispatcher.complete(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetriesExhausted);
        assert_eq!(upstream.sent().len(), 3);
    }

    #[tokio::test]
    async fn empty_pool_reports_no_credentials() {
        let upstream = ScriptedUpstream::with_script(vec![]);
        let (dispatcher, _, _) = dispatcher(upstream, gateway_config(&[], 4));
        let err = dispatcher.complete(&request(None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoCredentials);
    }

    #[tokio::test]
    async fn keyed_conversation_sticks_to_its_credential() {
        let upstream = ScriptedUpstream::with_script(vec![]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a", "b"], 4));
        for _ in 0..3 {
            dispatcher.complete(&request(Some("conv"))).await.unwrap();
        }
        assert_eq!(upstream.created(), 1);
        assert!(upstream.sent().iter().all(|(token, _)| token == "a"));
    }

    #[tokio::test]
    async fn streaming_call_relays_chunks() {
        let upstream = ScriptedUpstream::with_script(vec![Err(http(StatusCode::BAD_GATEWAY))]);
        let (dispatcher, _, _) = dispatcher(upstream.clone(), gateway_config(&["a"], 4));
        let mut req = request(None);
        req.stream = true;
        let chunks: Vec<_> = dispatcher.stream(&req).await.unwrap().collect().await;
        let text: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(text, "pong");
        assert!(matches!(chunks.last().unwrap().end, Some(StreamEnd::Stop { .. })));
        assert_eq!(upstream.created(), 1);
    }

    #[tokio::test]
    async fn models_include_mode_variants() {
        let upstream = ScriptedUpstream::with_script(vec![]);
        let (dispatcher, _, _) = dispatcher(upstream, gateway_config(&["a"], 4));
        let value = dispatcher.list_models().await.unwrap();
        let ids: Vec<&str> = value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"qwen-max-search"));
    }
}

use crate::app::AppState;
use crate::error::{AppError, AppResult, GatewayError};
use crate::wire::decode::openai_chat::decode_request;
use crate::wire::encode::openai_chat::{ChunkEncoder, encode_response};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;

const CONVERSATION_HEADER: &str = "x-conversation-id";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "qwenize: OpenAI-compatible gateway for Qwen chat",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.pool.snapshot();
    let healthy = snapshot.iter().filter(|c| c.healthy).count();
    let status = if snapshot.is_empty() {
        "no_credentials"
    } else if healthy == 0 {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "credentials": {
            "total": snapshot.len(),
            "healthy": healthy,
            "groups": snapshot,
        },
        "sessions": state.sessions.len(),
    }))
}

pub async fn config_view(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    state.auth.authorize(&headers)?;
    let config = &state.config;
    Ok(Json(json!({
        "base_url": config.base_url,
        "source": config.source,
        "timezone": config.timezone,
        "bx_v": config.bx_v,
        "credential_groups": config.credential_groups.len(),
        "thinking_models": config.thinking_models,
        "retry": config.retry,
    })))
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let value = state.dispatcher.list_models().await?;
    Ok(Json(value).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let header_key = headers
        .get(CONVERSATION_HEADER)
        .and_then(|v| v.to_str().ok());
    let req = decode_request(&body, header_key)?;
    tracing::info!(
        model = %req.requested_model,
        mode = req.mode.as_str(),
        stream = req.stream,
        messages = req.messages.len(),
        conversation = req.conversation_key.as_ref().map(|k| k.as_str()).unwrap_or(""),
        "chat completion request"
    );

    if req.stream {
        let mut encoder = ChunkEncoder::new(req.requested_model.clone());
        return match state.dispatcher.stream(&req).await {
            Ok(chunks) => {
                let events = chunks.flat_map(move |chunk| {
                    metrics::counter!("qwenize_stream_chunks_total").increment(1);
                    let payloads = encoder.encode(&chunk);
                    futures_util::stream::iter(
                        payloads
                            .into_iter()
                            .map(|data| Ok::<_, Infallible>(Event::default().data(data))),
                    )
                });
                Ok(sse_response(Sse::new(events).into_response()))
            }
            Err(err) => Ok(sse_response(
                Sse::new(error_to_sse_stream(&err)).into_response(),
            )),
        };
    }

    let completion = state.dispatcher.complete(&req).await?;
    Ok(Json(encode_response(&completion, &req.requested_model)).into_response())
}

fn sse_response(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

fn error_to_sse_stream(
    err: &GatewayError,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let app: AppError = err.clone().into();
    let error_json = json!({
        "error": {
            "message": app.message,
            "type": app.error_type,
            "code": app.code,
            "param": app.param,
        }
    });
    let events = vec![
        Ok(Event::default().data(error_json.to_string())),
        Ok(Event::default().data("[DONE]")),
    ];
    futures_util::stream::iter(events)
}

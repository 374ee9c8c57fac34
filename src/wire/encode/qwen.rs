use crate::config::{CredentialGroup, GatewayConfig};
use crate::upstream::UpstreamRequest;
use crate::wire::{ChatMode, ChatRequest, Role};
use serde_json::{Value, json};

const ORIGIN: &str = "https://chat.qwen.ai";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Headers every upstream call carries for the given credential.
pub fn credential_headers(config: &GatewayConfig, group: &CredentialGroup) -> Vec<(String, String)> {
    let mut headers = vec![
        ("authorization".to_string(), format!("Bearer {}", group.token)),
        ("accept".to_string(), "application/json, text/event-stream".to_string()),
        ("origin".to_string(), ORIGIN.to_string()),
        ("referer".to_string(), format!("{ORIGIN}/")),
        ("user-agent".to_string(), USER_AGENT.to_string()),
        ("source".to_string(), config.source.clone()),
        ("timezone".to_string(), config.timezone.clone()),
        ("bx-v".to_string(), config.bx_v.clone()),
    ];
    for (name, value) in group.header_pairs() {
        headers.retain(|(existing, _)| *existing != name);
        headers.push((name, value.to_string()));
    }
    headers
}

pub fn encode_new_chat(
    req: &ChatRequest,
    config: &GatewayConfig,
    group: &CredentialGroup,
    now_ms: i64,
) -> UpstreamRequest {
    let mut request = UpstreamRequest::post(
        "chats/new",
        json!({
            "title": "New Chat",
            "models": [req.model],
            "chat_mode": "normal",
            "chat_type": req.mode.chat_type(),
            "timestamp": now_ms,
        }),
    );
    request.headers = credential_headers(config, group);
    request
}

pub fn encode_completion(
    req: &ChatRequest,
    stream: bool,
    chat_id: &str,
    config: &GatewayConfig,
    group: &CredentialGroup,
    now_s: i64,
) -> UpstreamRequest {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|msg| encode_message(msg.role, &msg.content, &req.model, req.mode, now_s))
        .collect();
    let body = json!({
        "stream": stream,
        "incremental_output": true,
        "chat_id": chat_id,
        "chat_mode": "normal",
        "model": req.model,
        "parent_id": Value::Null,
        "messages": messages,
        "timestamp": now_s,
    });
    let mut request = UpstreamRequest::post("chat/completions", body);
    request.query = vec![("chat_id".to_string(), chat_id.to_string())];
    request.headers = credential_headers(config, group);
    request
}

pub fn encode_list_models(config: &GatewayConfig, group: &CredentialGroup) -> UpstreamRequest {
    let mut request = UpstreamRequest::get("models");
    request.headers = credential_headers(config, group);
    request
}

fn encode_message(role: Role, content: &str, model: &str, mode: ChatMode, now_s: i64) -> Value {
    let role = match role {
        Role::Developer => "system",
        Role::Tool => "user",
        other => other.as_str(),
    };
    let chat_type = mode.chat_type();
    json!({
        "fid": uuid::Uuid::new_v4().to_string(),
        "parentId": Value::Null,
        "childrenIds": [uuid::Uuid::new_v4().to_string()],
        "role": role,
        "content": content,
        "user_action": "chat",
        "files": [],
        "timestamp": now_s,
        "models": [model],
        "chat_type": chat_type,
        "feature_config": {
            "thinking_enabled": mode.thinking_enabled(),
            "output_schema": "phase",
        },
        "extra": {"meta": {"subChatType": chat_type}},
        "sub_chat_type": chat_type,
        "parent_id": Value::Null,
    })
}

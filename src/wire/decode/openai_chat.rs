use crate::error::{AppError, AppResult};
use crate::wire::decode::value_to_text;
use crate::wire::{ChatRequest, ConversationKey, Message, Role, normalize_mode};
use axum::http::StatusCode;
use serde_json::{Map, Value};

pub fn decode_request(value: &Value, header_key: Option<&str>) -> AppResult<ChatRequest> {
    let obj = value.as_object().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "chat request must be object",
        )
    })?;

    let requested_model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "model_required", "model is required")
                .with_param("model")
        })?
        .to_string();

    let raw_messages = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .filter(|arr| !arr.is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "messages_required",
                "messages must be a non-empty array",
            )
            .with_param("messages")
        })?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw_msg in raw_messages {
        let Some(msg_obj) = raw_msg.as_object() else {
            continue;
        };
        let role = match msg_obj
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("user")
        {
            "system" => Role::System,
            "developer" => Role::Developer,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        };
        let content = msg_obj.get("content").map(value_to_text).unwrap_or_default();
        messages.push(Message { role, content });
    }
    if messages.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "messages_required",
            "messages must contain at least one message object",
        )
        .with_param("messages"));
    }

    let explicit_mode = obj
        .get("chat_mode")
        .or_else(|| obj.get("mode"))
        .and_then(|v| v.as_str());
    let (model, mode) = normalize_mode(&requested_model, explicit_mode, thinking_hint(obj));

    let conversation_key = obj
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .and_then(ConversationKey::new)
        .or_else(|| header_key.and_then(ConversationKey::new));

    Ok(ChatRequest {
        requested_model,
        model,
        mode,
        messages,
        stream: obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        conversation_key,
    })
}

fn thinking_hint(obj: &Map<String, Value>) -> Option<bool> {
    if let Some(v) = obj.get("thinking_mode") {
        if let Some(enabled) = v.as_bool() {
            return Some(enabled);
        }
        if let Some(enabled) = v.get("enabled").and_then(|e| e.as_bool()) {
            return Some(enabled);
        }
    }
    if let Some(v) = obj.get("thinking") {
        if let Some(enabled) = v.as_bool() {
            return Some(enabled);
        }
        if let Some(kind) = v.get("type").and_then(|t| t.as_str()) {
            return Some(kind == "enabled");
        }
    }
    obj.get("enable_thinking").and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChatMode;
    use serde_json::json;

    #[test]
    fn decodes_model_messages_and_mode() {
        let body = json!({
            "model": "qwen3-235b-a22b-thinking",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "hello "},
                    {"type": "image_url", "image_url": {"url": "http://x"}},
                    {"type": "text", "text": "world"}
                ]}
            ]
        });
        let req = decode_request(&body, None).unwrap();
        assert_eq!(req.requested_model, "qwen3-235b-a22b-thinking");
        assert_eq!(req.model, "qwen3-235b-a22b");
        assert_eq!(req.mode, ChatMode::Thinking);
        assert!(req.stream);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].content, "hello world");
        assert!(req.conversation_key.is_none());
    }

    #[test]
    fn thinking_object_enables_thinking() {
        let body = json!({
            "model": "qwen-max",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        });
        assert_eq!(decode_request(&body, None).unwrap().mode, ChatMode::Thinking);

        let body = json!({
            "model": "qwen-max",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking_mode": {"enabled": true}
        });
        assert_eq!(decode_request(&body, None).unwrap().mode, ChatMode::Thinking);
    }

    #[test]
    fn body_conversation_id_wins_over_header() {
        let body = json!({
            "model": "qwen-max",
            "messages": [{"role": "user", "content": "hi"}],
            "conversation_id": "conv-body"
        });
        let req = decode_request(&body, Some("conv-header")).unwrap();
        assert_eq!(req.conversation_key.unwrap().as_str(), "conv-body");

        let body = json!({"model": "qwen-max", "messages": [{"role": "user", "content": "hi"}]});
        let req = decode_request(&body, Some(" conv-header ")).unwrap();
        assert_eq!(req.conversation_key.unwrap().as_str(), "conv-header");
    }

    #[test]
    fn blank_body_conversation_id_falls_back_to_header() {
        let body = json!({
            "model": "qwen-max",
            "messages": [{"role": "user", "content": "hi"}],
            "conversation_id": "  "
        });
        let req = decode_request(&body, Some("conv-header")).unwrap();
        assert_eq!(req.conversation_key.unwrap().as_str(), "conv-header");

        let req = decode_request(&body, None).unwrap();
        assert!(req.conversation_key.is_none());
    }

    #[test]
    fn missing_fields_are_rejected_with_stable_codes() {
        let err = decode_request(&json!({"messages": [{"role": "user", "content": "x"}]}), None)
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "model_required");

        let err = decode_request(&json!({"model": "qwen-max", "messages": []}), None).unwrap_err();
        assert_eq!(err.code, "messages_required");
    }
}

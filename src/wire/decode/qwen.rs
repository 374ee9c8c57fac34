use crate::upstream::UpstreamFailure;
use crate::wire::decode::{u64_field, value_to_text};
use crate::wire::{Completion, DeltaPhase, FinishReason, Usage};
use serde_json::Value;

/// Successful upstream bodies are usually wrapped as `{"success":true,"data":{...}}`.
fn unwrap_data(value: &Value) -> &Value {
    match value.get("data") {
        Some(data) if data.is_object() => data,
        _ => value,
    }
}

/// Failure reported inside a body that arrived with a success status.
pub fn declared_failure(value: &Value) -> Option<UpstreamFailure> {
    let detail = if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        value.get("data").filter(|d| d.is_object()).unwrap_or(value)
    } else if let Some(err) = value.get("error").filter(|e| e.is_object()) {
        err
    } else {
        return None;
    };
    let code = detail
        .get("code")
        .or_else(|| value.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let message = ["details", "message", "msg"]
        .iter()
        .find_map(|k| detail.get(*k).or_else(|| value.get(*k)).and_then(|v| v.as_str()))
        .unwrap_or("upstream reported failure");
    Some(UpstreamFailure::declared(code, message))
}

pub fn decode_new_chat(value: &Value) -> Result<String, String> {
    unwrap_data(value)
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| "new chat response has no id".to_string())
}

pub fn decode_usage(value: Option<&Value>) -> Usage {
    let Some(value) = value else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: u64_field(value, &["prompt_tokens", "input_tokens"]).unwrap_or(0),
        completion_tokens: u64_field(value, &["completion_tokens", "output_tokens"]).unwrap_or(0),
    }
}

pub fn decode_response(value: &Value) -> Result<Completion, String> {
    let data = unwrap_data(value);
    let choice = data
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| "completion has no choices".to_string())?;
    let message = choice
        .get("message")
        .or_else(|| choice.get("delta"))
        .ok_or_else(|| "completion choice has no message".to_string())?;

    let content = message.get("content").map(value_to_text).unwrap_or_default();
    let reasoning = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);
    let id = data
        .get("id")
        .or_else(|| data.get("response_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));

    Ok(Completion {
        id,
        content,
        reasoning,
        finish_reason,
        usage: decode_usage(data.get("usage")),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Done,
    Delta {
        /// `None` for upstream phases that are not relayed, such as search progress.
        phase: Option<DeltaPhase>,
        content: String,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
    Meta,
    Failure(UpstreamFailure),
}

/// Decodes one SSE `data:` payload. `Err` marks a malformed event.
pub fn decode_stream_event(data: &str) -> Result<StreamEvent, String> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let value: Value =
        serde_json::from_str(data).map_err(|err| format!("invalid event json: {err}"))?;
    if !value.is_object() {
        return Err("event is not a json object".to_string());
    }
    if let Some(failure) = declared_failure(&value) {
        return Ok(StreamEvent::Failure(failure));
    }

    let usage = value.get("usage").map(|u| decode_usage(Some(u)));
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Ok(match usage {
            Some(usage) => StreamEvent::Delta {
                phase: None,
                content: String::new(),
                finish_reason: None,
                usage: Some(usage),
            },
            None => StreamEvent::Meta,
        });
    };

    let delta = choice
        .get("delta")
        .or_else(|| choice.get("message"))
        .ok_or_else(|| "choice has no delta".to_string())?;
    let phase = match delta.get("phase").and_then(|v| v.as_str()) {
        None | Some("answer") => Some(DeltaPhase::Answer),
        Some("think") | Some("thinking") => Some(DeltaPhase::Thinking),
        Some(_) => None,
    };
    let content = delta
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let answer_finished = phase == Some(DeltaPhase::Answer)
        && delta.get("status").and_then(|v| v.as_str()) == Some("finished");
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(FinishReason::parse)
        .or(answer_finished.then_some(FinishReason::Stop));

    Ok(StreamEvent::Delta {
        phase,
        content,
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamErrorKind;
    use serde_json::json;

    #[test]
    fn new_chat_id_is_read_from_data() {
        let value = json!({"success": true, "data": {"id": "chat-123"}});
        assert_eq!(decode_new_chat(&value).unwrap(), "chat-123");
        assert!(decode_new_chat(&json!({"success": true, "data": {}})).is_err());
    }

    #[test]
    fn declared_failure_extracts_code_and_details() {
        let value = json!({"success": false, "data": {"code": "RateLimited", "details": "upper limit"}});
        let failure = declared_failure(&value).unwrap();
        assert_eq!(failure.kind, UpstreamErrorKind::Declared);
        assert_eq!(failure.code.as_deref(), Some("RateLimited"));
        assert_eq!(failure.message, "upper limit");
        assert!(declared_failure(&json!({"success": true, "data": {}})).is_none());
    }

    #[test]
    fn wrapped_completion_is_translated() {
        let value = json!({
            "success": true,
            "data": {
                "id": "resp-1",
                "choices": [{
                    "message": {"role": "assistant", "content": "hello", "reasoning_content": "hmm"},
                    "finish_reason": "stop"
                }],
                "usage": {"input_tokens": 7, "output_tokens": 3}
            }
        });
        let completion = decode_response(&value).unwrap();
        assert_eq!(completion.id, "resp-1");
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.reasoning.as_deref(), Some("hmm"));
        assert_eq!(completion.usage, Usage { prompt_tokens: 7, completion_tokens: 3 });
    }

    #[test]
    fn missing_usage_is_zero() {
        let value = json!({"choices": [{"message": {"content": "x"}}]});
        let completion = decode_response(&value).unwrap();
        assert_eq!(completion.usage, Usage::default());
        assert_eq!(completion.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn stream_events_are_classified() {
        assert_eq!(decode_stream_event(" [DONE] ").unwrap(), StreamEvent::Done);
        assert_eq!(
            decode_stream_event(r#"{"response.created":{"chat_id":"c"}}"#).unwrap(),
            StreamEvent::Meta
        );
        assert_eq!(
            decode_stream_event(
                r#"{"choices":[{"delta":{"content":"hm","phase":"think","status":"typing"}}]}"#
            )
            .unwrap(),
            StreamEvent::Delta {
                phase: Some(DeltaPhase::Thinking),
                content: "hm".to_string(),
                finish_reason: None,
                usage: None,
            }
        );
        assert!(decode_stream_event("{not json").is_err());
        assert!(matches!(
            decode_stream_event(r#"{"error":{"code":"Internal_Error","details":"boom"}}"#).unwrap(),
            StreamEvent::Failure(_)
        ));
    }

    #[test]
    fn finished_answer_phase_carries_stop() {
        let event = decode_stream_event(
            r#"{"choices":[{"delta":{"content":"","phase":"answer","status":"finished"}}],"usage":{"prompt_tokens":2,"completion_tokens":5}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Delta {
                phase: Some(DeltaPhase::Answer),
                content: String::new(),
                finish_reason: Some(FinishReason::Stop),
                usage: Some(Usage { prompt_tokens: 2, completion_tokens: 5 }),
            }
        );

        let think_done = decode_stream_event(
            r#"{"choices":[{"delta":{"content":"","phase":"think","status":"finished"}}]}"#,
        )
        .unwrap();
        assert!(matches!(think_done, StreamEvent::Delta { finish_reason: None, .. }));
    }
}

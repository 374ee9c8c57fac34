use crate::wire::{Completion, DeltaPhase, StreamChunk, StreamEnd, Usage};
use serde_json::{Map, Value, json};

pub fn encode_response(resp: &Completion, logical_model: &str) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert("content".to_string(), Value::String(resp.content.clone()));
    if let Some(reasoning) = &resp.reasoning {
        message.insert(
            "reasoning_content".to_string(),
            Value::String(reasoning.clone()),
        );
    }

    json!({
        "id": resp.id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": logical_model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": resp.finish_reason.as_str(),
        }],
        "usage": encode_usage(&resp.usage),
    })
}

fn encode_usage(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens(),
    })
}

/// Turns relay chunks into `chat.completion.chunk` payloads for one response.
///
/// The first payload carries the assistant role; the terminal chunk yields the
/// finish (or error) payload followed by `[DONE]`.
pub struct ChunkEncoder {
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            role_sent: false,
        }
    }

    pub fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut out = Vec::new();
        if !chunk.delta.is_empty() {
            let mut delta = Map::new();
            if !self.role_sent {
                delta.insert("role".to_string(), Value::String("assistant".to_string()));
                self.role_sent = true;
            }
            let field = match chunk.phase {
                DeltaPhase::Answer => "content",
                DeltaPhase::Thinking => "reasoning_content",
            };
            delta.insert(field.to_string(), Value::String(chunk.delta.clone()));
            out.push(self.chunk(Value::Object(delta), Value::Null, None).to_string());
        }

        match &chunk.end {
            None => {}
            Some(StreamEnd::Stop {
                finish_reason,
                usage,
            }) => {
                let mut delta = Map::new();
                if !self.role_sent {
                    delta.insert("role".to_string(), Value::String("assistant".to_string()));
                    self.role_sent = true;
                }
                let finish = Value::String(finish_reason.as_str().to_string());
                out.push(
                    self.chunk(Value::Object(delta), finish, usage.as_ref())
                        .to_string(),
                );
                out.push("[DONE]".to_string());
            }
            Some(StreamEnd::Error(err)) => {
                out.push(
                    json!({
                        "error": {
                            "message": err.message,
                            "type": "upstream_error",
                            "code": err.kind.as_str(),
                            "param": Value::Null,
                        }
                    })
                    .to_string(),
                );
                out.push("[DONE]".to_string());
            }
        }
        out
    }

    fn chunk(&self, delta: Value, finish_reason: Value, usage: Option<&Usage>) -> Value {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = encode_usage(usage);
        }
        chunk
    }
}

/// Upstream model list in OpenAI shape, with a `-thinking` entry for models
/// that support it and a `-search` entry for every model.
pub fn encode_models(upstream: &Value, thinking_models: &[String]) -> Value {
    let data = upstream.get("data").unwrap_or(upstream);
    let entries = data
        .as_array()
        .or_else(|| data.get("data").and_then(|v| v.as_array()))
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for entry in entries {
        let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        let owned_by = entry
            .get("owned_by")
            .and_then(|v| v.as_str())
            .unwrap_or("qwen");
        let created = entry
            .get("created")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let model = |id: String| {
            json!({"id": id, "object": "model", "created": created, "owned_by": owned_by})
        };
        out.push(model(id.to_string()));
        if thinking_models.iter().any(|m| m == id) {
            out.push(model(format!("{id}-thinking")));
        }
        out.push(model(format!("{id}-search")));
    }
    json!({"object": "list", "data": out})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, GatewayError};
    use crate::wire::FinishReason;

    fn chunk(index: u64, phase: DeltaPhase, delta: &str, end: Option<StreamEnd>) -> StreamChunk {
        StreamChunk {
            index,
            phase,
            delta: delta.to_string(),
            end,
        }
    }

    #[test]
    fn response_has_usage_totals_and_reasoning() {
        let completion = Completion {
            id: "resp-1".to_string(),
            content: "hi".to_string(),
            reasoning: Some("thought".to_string()),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 4,
                completion_tokens: 2,
            },
        };
        let value = encode_response(&completion, "qwen-max-thinking");
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["model"], "qwen-max-thinking");
        assert_eq!(value["choices"][0]["message"]["content"], "hi");
        assert_eq!(value["choices"][0]["message"]["reasoning_content"], "thought");
        assert_eq!(value["usage"]["total_tokens"], 6);
    }

    #[test]
    fn oversized_usage_saturates_instead_of_overflowing() {
        let completion = Completion {
            id: "resp-2".to_string(),
            content: String::new(),
            reasoning: None,
            finish_reason: FinishReason::Length,
            usage: Usage {
                prompt_tokens: u64::MAX,
                completion_tokens: 7,
            },
        };
        let value = encode_response(&completion, "qwen-max");
        assert_eq!(value["usage"]["total_tokens"], u64::MAX);
        assert_eq!(value["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn stream_chunks_carry_role_once_and_end_with_done() {
        let mut encoder = ChunkEncoder::new("qwen-max");
        let first = encoder.encode(&chunk(0, DeltaPhase::Thinking, "hmm", None));
        let second = encoder.encode(&chunk(1, DeltaPhase::Answer, "hi", None));
        let last = encoder.encode(&chunk(
            2,
            DeltaPhase::Answer,
            "",
            Some(StreamEnd::Stop {
                finish_reason: FinishReason::Stop,
                usage: None,
            }),
        ));

        let first: Value = serde_json::from_str(&first[0]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["reasoning_content"], "hmm");
        let second: Value = serde_json::from_str(&second[0]).unwrap();
        assert!(second["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second["choices"][0]["delta"]["content"], "hi");
        assert_eq!(last.len(), 2);
        let finish: Value = serde_json::from_str(&last[0]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(last[1], "[DONE]");
    }

    #[test]
    fn error_terminal_emits_error_payload() {
        let mut encoder = ChunkEncoder::new("qwen-max");
        let out = encoder.encode(&chunk(
            0,
            DeltaPhase::Answer,
            "",
            Some(StreamEnd::Error(GatewayError::new(
                ErrorKind::StreamInterrupted,
                "idle",
            ))),
        ));
        let err: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(err["error"]["code"], "stream_interrupted");
        assert_eq!(out[1], "[DONE]");
    }

    #[test]
    fn models_gain_mode_variants() {
        let upstream = json!({"data": [{"id": "qwen3-235b-a22b"}, {"id": "qwen-max"}]});
        let value = encode_models(&upstream, &["qwen3-235b-a22b".to_string()]);
        let ids: Vec<&str> = value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                "qwen3-235b-a22b",
                "qwen3-235b-a22b-thinking",
                "qwen3-235b-a22b-search",
                "qwen-max",
                "qwen-max-search",
            ]
        );
    }
}

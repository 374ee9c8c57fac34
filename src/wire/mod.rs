use crate::error::GatewayError;
use serde::{Deserialize, Serialize};

pub mod decode;
pub mod encode;
pub mod mode;

pub use mode::{ChatMode, normalize_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Developer => "developer",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Caller-chosen identifier that groups calls into one upstream chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model name as the caller sent it; echoed back in responses.
    pub requested_model: String,
    /// Model name with any mode suffix stripped.
    pub model: String,
    pub mode: ChatMode,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub conversation_key: Option<ConversationKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaPhase {
    Answer,
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Stop {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
    Error(GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub index: u64,
    pub phase: DeltaPhase,
    pub delta: String,
    pub end: Option<StreamEnd>,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        self.end.is_some()
    }
}

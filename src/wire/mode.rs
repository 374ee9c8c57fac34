use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Normal,
    Thinking,
    Search,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Normal => "normal",
            ChatMode::Thinking => "thinking",
            ChatMode::Search => "search",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" | "t2t" | "chat" => Some(ChatMode::Normal),
            "thinking" | "think" | "reasoning" => Some(ChatMode::Thinking),
            "search" | "web_search" => Some(ChatMode::Search),
            _ => None,
        }
    }

    /// Upstream `chat_type` discriminator.
    pub fn chat_type(&self) -> &'static str {
        match self {
            ChatMode::Search => "search",
            ChatMode::Normal | ChatMode::Thinking => "t2t",
        }
    }

    pub fn thinking_enabled(&self) -> bool {
        matches!(self, ChatMode::Thinking)
    }
}

const SUFFIXES: [(&str, ChatMode); 2] = [("-thinking", ChatMode::Thinking), ("-search", ChatMode::Search)];

/// Resolves the chat mode and the upstream model name in one pass.
///
/// Precedence: an explicit mode flag, then an enabled thinking hint, then the
/// model suffix. A recognised suffix is stripped even when it loses.
pub fn normalize_mode(model: &str, explicit: Option<&str>, thinking: Option<bool>) -> (String, ChatMode) {
    let model = model.trim();
    let lower = model.to_ascii_lowercase();
    let (base, suffix_mode) = SUFFIXES
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix) && lower.len() > suffix.len())
        .map(|(suffix, mode)| (&model[..model.len() - suffix.len()], Some(*mode)))
        .unwrap_or((model, None));

    let mode = explicit
        .and_then(ChatMode::parse)
        .or_else(|| thinking.filter(|enabled| *enabled).map(|_| ChatMode::Thinking))
        .or(suffix_mode)
        .unwrap_or_default();
    (base.to_string(), mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_selects_mode_and_is_stripped() {
        assert_eq!(
            normalize_mode("qwen3-235b-a22b-thinking", None, None),
            ("qwen3-235b-a22b".to_string(), ChatMode::Thinking)
        );
        assert_eq!(
            normalize_mode("qwen-max-SEARCH", None, None),
            ("qwen-max".to_string(), ChatMode::Search)
        );
        assert_eq!(
            normalize_mode("qwen-max", None, None),
            ("qwen-max".to_string(), ChatMode::Normal)
        );
    }

    #[test]
    fn explicit_flag_beats_thinking_hint_and_suffix() {
        assert_eq!(
            normalize_mode("qwen-max-thinking", Some("search"), Some(true)),
            ("qwen-max".to_string(), ChatMode::Search)
        );
        assert_eq!(
            normalize_mode("qwen-max-search", Some("normal"), None),
            ("qwen-max".to_string(), ChatMode::Normal)
        );
    }

    #[test]
    fn thinking_hint_beats_suffix() {
        assert_eq!(
            normalize_mode("qwen-max-search", None, Some(true)),
            ("qwen-max".to_string(), ChatMode::Thinking)
        );
        assert_eq!(
            normalize_mode("qwen-max-search", None, Some(false)),
            ("qwen-max".to_string(), ChatMode::Search)
        );
    }

    #[test]
    fn unknown_explicit_mode_falls_through() {
        assert_eq!(
            normalize_mode("qwen-max-thinking", Some("turbo"), None),
            ("qwen-max".to_string(), ChatMode::Thinking)
        );
    }

    #[test]
    fn bare_suffix_is_not_a_model() {
        assert_eq!(
            normalize_mode("-thinking", None, None),
            ("-thinking".to_string(), ChatMode::Normal)
        );
    }

    #[test]
    fn modes_map_to_upstream_flags() {
        assert_eq!(ChatMode::Search.chat_type(), "search");
        assert_eq!(ChatMode::Thinking.chat_type(), "t2t");
        assert!(ChatMode::Thinking.thinking_enabled());
        assert!(!ChatMode::Normal.thinking_enabled());
    }
}

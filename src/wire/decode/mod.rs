pub mod openai_chat;
pub mod qwen;

use serde_json::Value;

/// Flattens message content: strings pass through, text parts are concatenated,
/// anything else is dropped.
pub fn value_to_text(v: &Value) -> String {
    if let Some(s) = v.as_str() {
        return s.to_string();
    }
    if let Some(arr) = v.as_array() {
        let mut out = String::new();
        for item in arr {
            if let Some(s) = item.as_str() {
                out.push_str(s);
                continue;
            }
            if let Some(obj) = item.as_object() {
                if let Some(text) = obj.get("text").and_then(|x| x.as_str()) {
                    out.push_str(text);
                }
            }
        }
        return out;
    }
    String::new()
}

pub fn u64_field(obj: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(|v| v.as_u64()))
}

//! Provider adapters.

pub mod anthropic;
pub mod lorem;
pub mod openai;
pub mod unified;

use serde_json::Value;

pub use anthropic::AnthropicProvider;
pub use lorem::{LoremConfig, LoremProvider};
pub use openai::OpenAiProvider;
pub use unified::{UnifiedBackend, UnifiedProvider};

/// Render a tool result payload as the plain text most APIs expect.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Text to send upstream for a reference block.
pub(crate) fn reference_text(content: &Value) -> String {
    content
        .get("text")
        .and_then(Value::as_str)
        .map_or_else(|| value_to_text(content), str::to_string)
}

/// Parse accumulated tool-call JSON, treating an empty buffer as `{}`.
pub(crate) fn parse_tool_input(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "tool input was not valid JSON");
        Value::Object(serde_json::Map::new())
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_tool_input_is_an_object() {
        assert_eq!(parse_tool_input(""), json!({}));
        assert_eq!(parse_tool_input("{\"q\":1}"), json!({"q": 1}));
    }

    #[test]
    fn references_prefer_their_text_field() {
        assert_eq!(reference_text(&json!({"text": "quote"})), "quote");
        assert_eq!(reference_text(&json!("raw")), "raw");
    }
}

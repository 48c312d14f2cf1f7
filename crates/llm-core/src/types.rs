//! Normalized conversation types.
//!
//! Every adapter translates to and from these shapes. A [`Block`] pairs a
//! typed payload with an opaque `provider_data` side channel that is only
//! ever read back by the adapter that produced it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Kind of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Image,
    Reference,
    PartialReference,
    WebSearchUse,
    WebSearchResult,
}

impl BlockType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Image => "image",
            Self::Reference => "reference",
            Self::PartialReference => "partial_reference",
            Self::WebSearchUse => "web_search_use",
            Self::WebSearchResult => "web_search_result",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => Self::Text,
            "thinking" => Self::Thinking,
            "tool_use" => Self::ToolUse,
            "tool_result" => Self::ToolResult,
            "image" => Self::Image,
            "reference" => Self::Reference,
            "partial_reference" => Self::PartialReference,
            "web_search_use" => Self::WebSearchUse,
            "web_search_result" => Self::WebSearchResult,
            other => return Err(format!("unknown block type: {other}")),
        })
    }
}

/// Typed content of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block_type", rename_all = "snake_case")]
pub enum BlockPayload {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        is_error: bool,
        content: Value,
    },
    Image {
        content: Value,
    },
    Reference {
        content: Value,
    },
    PartialReference {
        content: Value,
    },
    WebSearchUse {
        tool_use_id: String,
        input: Value,
    },
    WebSearchResult {
        tool_use_id: String,
        results: Value,
    },
}

impl BlockPayload {
    #[must_use]
    pub const fn block_type(&self) -> BlockType {
        match self {
            Self::Text { .. } => BlockType::Text,
            Self::Thinking { .. } => BlockType::Thinking,
            Self::ToolUse { .. } => BlockType::ToolUse,
            Self::ToolResult { .. } => BlockType::ToolResult,
            Self::Image { .. } => BlockType::Image,
            Self::Reference { .. } => BlockType::Reference,
            Self::PartialReference { .. } => BlockType::PartialReference,
            Self::WebSearchUse { .. } => BlockType::WebSearchUse,
            Self::WebSearchResult { .. } => BlockType::WebSearchResult,
        }
    }
}

/// One typed content unit of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub payload: BlockPayload,

    /// Adapter that produced this block, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Opaque adapter metadata, preserved for same-provider replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_data: Option<Value>,
}

impl Block {
    #[must_use]
    pub const fn new(payload: BlockPayload) -> Self {
        Self {
            payload,
            provider: None,
            provider_data: None,
        }
    }

    /// Plain text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(BlockPayload::Text { text: text.into() })
    }

    /// Tool call requested by the model.
    #[must_use]
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::new(BlockPayload::ToolUse {
            tool_use_id: id.into(),
            tool_name: name.into(),
            input,
        })
    }

    /// Result of executing a tool call.
    #[must_use]
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        tool_name: Option<String>,
        content: Value,
        is_error: bool,
    ) -> Self {
        Self::new(BlockPayload::ToolResult {
            tool_use_id: tool_use_id.into(),
            tool_name,
            is_error,
            content,
        })
    }

    /// Tag the block with the adapter that produced it.
    #[must_use]
    pub fn with_provider(mut self, provider: &str, data: Option<Value>) -> Self {
        self.provider = Some(provider.to_string());
        self.provider_data = data;
        self
    }

    #[must_use]
    pub const fn block_type(&self) -> BlockType {
        self.payload.block_type()
    }

    /// Text carried by text and thinking blocks.
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            BlockPayload::Text { text } | BlockPayload::Thinking { text } => Some(text),
            _ => None,
        }
    }

    /// Prepare the block for replay to `provider`.
    ///
    /// Thinking content can only be sent back to the adapter that signed it.
    /// Unsigned thinking, or thinking from another provider, becomes text.
    #[must_use]
    pub fn for_replay(&self, provider: &str) -> Self {
        match &self.payload {
            BlockPayload::Thinking { text }
                if self.provider.as_deref() != Some(provider) || self.provider_data.is_none() =>
            {
                Self::text(text.clone())
            }
            _ => self.clone(),
        }
    }
}

/// A role-tagged list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl Message {
    #[must_use]
    pub const fn new(role: Role, blocks: Vec<Block>) -> Self {
        Self { role, blocks }
    }

    /// Single-block user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Block::text(text)])
    }

    /// Concatenated text of every text block.
    #[must_use]
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.block_type() == BlockType::Text)
            .filter_map(Block::text_content)
            .collect()
    }
}

/// Tool made available to the model.
///
/// Built-in tools carry only a name; adapters map them to native
/// definitions. Custom tools carry a description and input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDefinition {
    #[must_use]
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    #[must_use]
    pub fn custom(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: Some(schema),
        }
    }

    #[must_use]
    pub const fn is_builtin(&self) -> bool {
        self.input_schema.is_none()
    }
}

/// Generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: None,
            system: None,
            tools: Vec::new(),
            thinking: false,
            thinking_budget: None,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
        }
    }

    /// Map the stop reasons used across upstream APIs.
    #[must_use]
    pub fn from_upstream(reason: &str) -> Option<Self> {
        match reason {
            "end_turn" | "stop" => Some(Self::EndTurn),
            "tool_use" | "tool_calls" => Some(Self::ToolUse),
            "max_tokens" | "length" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            _ => None,
        }
    }
}

/// Token usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    /// Accumulate another call's usage.
    pub fn add(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Payload of an incremental block change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delta_type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        #[serde(rename = "text_delta")]
        text: String,
    },
    ThinkingDelta {
        #[serde(rename = "text_delta")]
        text: String,
    },
    SignatureDelta {
        #[serde(rename = "signature_delta")]
        signature: String,
    },
    ToolCallStart {
        tool_use_id: String,
        tool_name: String,
    },
    JsonDelta {
        #[serde(rename = "json_delta")]
        json: String,
    },
    UsageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u32>,
    },
}

/// Transient change to one block during generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub block_index: u32,
    #[serde(flatten)]
    pub delta: Delta,
}

impl StreamDelta {
    #[must_use]
    pub const fn new(block_index: u32, delta: Delta) -> Self {
        Self { block_index, delta }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn block_type_round_trips_through_str() {
        for ty in [
            BlockType::Text,
            BlockType::PartialReference,
            BlockType::WebSearchResult,
        ] {
            assert_eq!(ty.as_str().parse::<BlockType>().unwrap(), ty);
        }
        assert!("video".parse::<BlockType>().is_err());
    }

    #[test]
    fn unsigned_thinking_replays_as_text() {
        let block = Block::new(BlockPayload::Thinking {
            text: "hmm".to_string(),
        })
        .with_provider("anthropic", None);

        let replayed = block.for_replay("anthropic");
        assert_eq!(replayed.block_type(), BlockType::Text);
        assert_eq!(replayed.text_content(), Some("hmm"));
    }

    #[test]
    fn signed_thinking_replays_only_to_its_provider() {
        let block = Block::new(BlockPayload::Thinking {
            text: "hmm".to_string(),
        })
        .with_provider("anthropic", Some(json!({"signature": "sig"})));

        assert_eq!(block.for_replay("anthropic"), block);
        assert_eq!(block.for_replay("openai").block_type(), BlockType::Text);
    }

    #[test]
    fn delta_serializes_with_wire_names() {
        let delta = StreamDelta::new(
            2,
            Delta::TextDelta {
                text: "hi".to_string(),
            },
        );
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            value,
            json!({"block_index": 2, "delta_type": "text_delta", "text_delta": "hi"})
        );
    }

    #[test]
    fn builtin_tools_have_no_schema() {
        assert!(ToolDefinition::builtin("web_search").is_builtin());
        assert!(!ToolDefinition::custom("doc_view", "View", json!({})).is_builtin());
    }

    #[test]
    fn message_text_skips_thinking() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                Block::new(BlockPayload::Thinking {
                    text: "plan".to_string(),
                }),
                Block::text("hello "),
                Block::text("world"),
            ],
        );
        assert_eq!(msg.text(), "hello world");
    }
}

//! `OpenAI` provider implementation.
//!
//! Provides streaming completions via the `OpenAI` Chat Completions API and
//! compatible endpoints (`OpenRouter`, local servers).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::{parse_tool_input, reference_text, value_to_text};
use crate::error::{ProviderError, Result, parse_retry_after};
use crate::provider::{CompletionEvent, CompletionRequest, CompletionStream, LlmProvider};
use crate::sse::parse_sse_frame;
use crate::types::{
    Block, BlockPayload, BlockType, Delta, Message, Role, StopReason, StreamDelta, ToolDefinition,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// LLM provider for the `OpenAI` API and compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    name: String,
}

impl OpenAiProvider {
    /// Create a new provider instance.
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::missing_api_key("openai"));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: Some(api_key),
            base_url: DEFAULT_BASE_URL.to_string(),
            name: "openai".to_string(),
        })
    }

    /// Create a provider with optional API key and base URL.
    ///
    /// Use this for OpenAI-compatible providers that may not require an API key
    /// (e.g., local Ollama) or use a different endpoint.
    #[must_use]
    pub fn with_config(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            name: name.into(),
        }
    }
}

// OpenAI request types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    const fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRequest {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// OpenAI response types for SSE parsing

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning text, as emitted by `DeepSeek`-style and `OpenRouter` endpoints.
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Convert our messages to the format expected by the chat completions API.
fn convert_messages(messages: &[Message], system: Option<&str>, provider: &str) -> Vec<OpenAiMessage> {
    let mut result = Vec::new();

    if let Some(sys) = system {
        result.push(OpenAiMessage::text("system", sys.to_string()));
    }

    for msg in messages {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for block in msg.blocks.iter().map(|b| b.for_replay(provider)) {
            match block.payload {
                BlockPayload::Text { text } => text_parts.push(text),
                BlockPayload::Reference { content } | BlockPayload::PartialReference { content } => {
                    text_parts.push(reference_text(&content));
                }
                BlockPayload::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => tool_calls.push(OpenAiToolCallRequest {
                    id: tool_use_id,
                    call_type: "function",
                    function: OpenAiFunctionCall {
                        name: tool_name,
                        arguments: input.to_string(),
                    },
                }),
                BlockPayload::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    ..
                } => {
                    let text = value_to_text(&content);
                    let text = if is_error { format!("Error: {text}") } else { text };
                    tool_results.push((tool_use_id, text));
                }
                // Reasoning from this API is not replayable; server tools and
                // images are not representable here.
                BlockPayload::Thinking { .. }
                | BlockPayload::Image { .. }
                | BlockPayload::WebSearchUse { .. }
                | BlockPayload::WebSearchResult { .. } => {}
            }
        }

        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        if !tool_calls.is_empty() {
            let content = if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join(""))
            };
            result.push(OpenAiMessage {
                role: "assistant",
                content,
                tool_calls: Some(tool_calls),
                tool_call_id: None,
            });
        } else if !text_parts.is_empty() {
            result.push(OpenAiMessage::text(role, text_parts.join("")));
        }

        for (tool_use_id, content) in tool_results {
            result.push(OpenAiMessage {
                role: "tool",
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            });
        }
    }

    result
}

/// Convert custom tools to the function calling format.
///
/// Built-in tools have no function-calling equivalent and are dropped.
fn convert_tools(tools: &[ToolDefinition]) -> Vec<OpenAiTool> {
    tools
        .iter()
        .filter(|t| !t.is_builtin())
        .map(|t| OpenAiTool {
            tool_type: "function",
            function: OpenAiFunction {
                name: t.name.clone(),
                description: t.description.clone().unwrap_or_default(),
                parameters: t
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            },
        })
        .collect()
}

/// Parsed SSE payload.
enum Frame {
    Chunk(OpenAiChunk),
    Done,
}

fn parse_frame(data: &str) -> Option<Frame> {
    if data.trim() == "[DONE]" {
        return Some(Frame::Done);
    }
    match serde_json::from_str::<OpenAiChunk>(data) {
        Ok(chunk) => Some(Frame::Chunk(chunk)),
        Err(e) => {
            tracing::debug!(data = %data, error = %e, "failed to parse OpenAI event");
            None
        }
    }
}

/// Assigns normalized block indices as content appears.
///
/// Chat Completions has no block framing: reasoning, text and tool calls
/// arrive interleaved on one delta. Each kind gets an index on first sight,
/// and reasoning or text closes when a different kind starts.
#[derive(Debug, Default)]
struct BlockTracker {
    next_index: u32,
    reasoning: Option<(u32, String)>,
    text: Option<(u32, String)>,
    tools: BTreeMap<usize, PendingTool>,
}

#[derive(Debug)]
struct PendingTool {
    index: u32,
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl BlockTracker {
    fn allocate(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn close_reasoning(&mut self, provider: &str, events: &mut Vec<CompletionEvent>) {
        if let Some((index, text)) = self.reasoning.take() {
            events.push(CompletionEvent::BlockStop {
                index,
                block: Block::new(BlockPayload::Thinking { text }).with_provider(provider, None),
            });
        }
    }

    fn close_text(&mut self, provider: &str, events: &mut Vec<CompletionEvent>) {
        if let Some((index, text)) = self.text.take() {
            events.push(CompletionEvent::BlockStop {
                index,
                block: Block::text(text).with_provider(provider, None),
            });
        }
    }

    fn reasoning_delta(&mut self, provider: &str, text: String, events: &mut Vec<CompletionEvent>) {
        self.close_text(provider, events);
        let index = if let Some((index, buf)) = &mut self.reasoning {
            buf.push_str(&text);
            *index
        } else {
            let index = self.allocate();
            events.push(CompletionEvent::BlockStart {
                index,
                block_type: BlockType::Thinking,
            });
            self.reasoning = Some((index, text.clone()));
            index
        };
        events.push(CompletionEvent::Delta(StreamDelta::new(
            index,
            Delta::ThinkingDelta { text },
        )));
    }

    fn text_delta(&mut self, provider: &str, text: String, events: &mut Vec<CompletionEvent>) {
        self.close_reasoning(provider, events);
        let index = if let Some((index, buf)) = &mut self.text {
            buf.push_str(&text);
            *index
        } else {
            let index = self.allocate();
            events.push(CompletionEvent::BlockStart {
                index,
                block_type: BlockType::Text,
            });
            self.text = Some((index, text.clone()));
            index
        };
        events.push(CompletionEvent::Delta(StreamDelta::new(
            index,
            Delta::TextDelta { text },
        )));
    }

    fn tool_delta(
        &mut self,
        provider: &str,
        call: OpenAiToolCallDelta,
        events: &mut Vec<CompletionEvent>,
    ) {
        self.close_reasoning(provider, events);
        self.close_text(provider, events);

        if !self.tools.contains_key(&call.index) {
            let index = self.allocate();
            self.tools.insert(
                call.index,
                PendingTool {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                    started: false,
                },
            );
        }
        let Some(tool) = self.tools.get_mut(&call.index) else {
            return;
        };

        if let Some(id) = call.id {
            tool.id = id;
        }
        let (name, arguments) = call
            .function
            .map_or((None, None), |f| (f.name, f.arguments));
        if let Some(name) = name {
            tool.name.push_str(&name);
        }
        if !tool.started && !tool.name.is_empty() {
            tool.started = true;
            events.push(CompletionEvent::BlockStart {
                index: tool.index,
                block_type: BlockType::ToolUse,
            });
            events.push(CompletionEvent::Delta(StreamDelta::new(
                tool.index,
                Delta::ToolCallStart {
                    tool_use_id: tool.id.clone(),
                    tool_name: tool.name.clone(),
                },
            )));
        }
        if let Some(arguments) = arguments.filter(|a| !a.is_empty()) {
            tool.arguments.push_str(&arguments);
            if tool.started {
                events.push(CompletionEvent::Delta(StreamDelta::new(
                    tool.index,
                    Delta::JsonDelta { json: arguments },
                )));
            }
        }
    }

    /// Close every open block in index order.
    fn finish(&mut self, provider: &str, events: &mut Vec<CompletionEvent>) {
        self.close_reasoning(provider, events);
        self.close_text(provider, events);
        for tool in std::mem::take(&mut self.tools).into_values() {
            if !tool.started {
                continue;
            }
            events.push(CompletionEvent::BlockStop {
                index: tool.index,
                block: Block::tool_use(tool.id, tool.name, parse_tool_input(&tool.arguments))
                    .with_provider(provider, None),
            });
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Add authorization header if API key is present
        if let Some(api_key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}"))
                    .map_err(|_| ProviderError::Authentication("invalid API key".to_string()))?,
            );
        }

        let params = &request.params;
        let tools = convert_tools(&params.tools);
        let openai_request = OpenAiRequest {
            model: request.model.clone(),
            max_tokens: params.max_tokens,
            messages: convert_messages(&request.messages, params.system.as_deref(), &self.name),
            temperature: params.temperature,
            tools: if tools.is_empty() { None } else { Some(tools) },
            reasoning_effort: params.thinking.then_some("medium"),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        tracing::debug!(provider = %self.name, model = %request.model, "chat completions request");

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&openai_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                &message,
                retry_after,
            ));
        }

        let byte_stream = response.bytes_stream();
        let provider = self.name.clone();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut tracker = BlockTracker::default();
            let mut usage = Usage::default();
            let mut model = None;
            let mut stop_reason = None;

            futures::pin_mut!(byte_stream);

            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some((frame, remainder)) = parse_sse_frame(&buffer) {
                    buffer = remainder;

                    let Some(frame) = frame.and_then(|f| parse_frame(&f.data)) else {
                        continue;
                    };
                    let chunk = match frame {
                        Frame::Chunk(chunk) => chunk,
                        Frame::Done => break 'read,
                    };

                    if model.is_none() {
                        model = chunk.model;
                    }
                    if let Some(u) = chunk.usage {
                        usage = Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens };
                    }

                    let mut events = Vec::new();
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
                            tracker.reasoning_delta(&provider, text, &mut events);
                        }
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            tracker.text_delta(&provider, text, &mut events);
                        }
                        for call in choice.delta.tool_calls.unwrap_or_default() {
                            tracker.tool_delta(&provider, call, &mut events);
                        }
                        if let Some(reason) = choice.finish_reason {
                            stop_reason = StopReason::from_upstream(&reason).or(Some(StopReason::EndTurn));
                            tracker.finish(&provider, &mut events);
                        }
                    }
                    for event in events {
                        yield Ok(event);
                    }
                }
            }

            let Some(stop_reason) = stop_reason else {
                yield Err(ProviderError::Network("stream ended without finish_reason".to_string()));
                return;
            };

            yield Ok(CompletionEvent::Delta(StreamDelta::new(
                tracker.next_index.saturating_sub(1),
                Delta::UsageDelta {
                    input_tokens: Some(usage.input_tokens),
                    output_tokens: Some(usage.output_tokens),
                },
            )));
            yield Ok(CompletionEvent::Done { model, stop_reason, usage, metadata: None });
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool_call(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> OpenAiToolCallDelta {
        OpenAiToolCallDelta {
            index,
            id: id.map(str::to_string),
            function: Some(OpenAiFunctionDelta {
                name: name.map(str::to_string),
                arguments: args.map(str::to_string),
            }),
        }
    }

    #[test]
    fn provider_requires_api_key() {
        let result = OpenAiProvider::new("");
        assert!(result.is_err());
    }

    #[test]
    fn provider_name_is_openai() {
        let provider = OpenAiProvider::new("test-key").unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn with_config_uses_default_base_url() {
        let provider = OpenAiProvider::with_config("openai", Some("key".to_string()), None);
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn with_config_custom_name_and_url() {
        let provider = OpenAiProvider::with_config(
            "openrouter",
            None,
            Some("https://openrouter.ai/api/v1".to_string()),
        );
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.api_key.is_none());
    }

    #[test]
    fn convert_tools_skips_builtins() {
        let tools = vec![
            ToolDefinition::builtin("web_search"),
            ToolDefinition::custom("doc_tree", "List documents", json!({"type": "object"})),
        ];

        let openai_tools = convert_tools(&tools);
        assert_eq!(openai_tools.len(), 1);
        assert_eq!(openai_tools[0].tool_type, "function");
        assert_eq!(openai_tools[0].function.name, "doc_tree");
    }

    #[test]
    fn convert_messages_splits_tool_results() {
        let messages = vec![
            Message::user("Hello"),
            Message::new(
                Role::Assistant,
                vec![
                    Block::text("Checking."),
                    Block::tool_use("call_1", "doc_view", json!({"path": "a.md"})),
                ],
            ),
            Message::new(
                Role::User,
                vec![Block::tool_result("call_1", None, json!("contents"), false)],
            ),
        ];

        let converted = convert_messages(&messages, Some("You are helpful"), "openai");
        let roles: Vec<_> = converted.iter().map(|m| m.role).collect();
        assert_eq!(roles, ["system", "user", "assistant", "tool"]);
        assert_eq!(converted[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(converted[3].content.as_deref(), Some("contents"));
    }

    #[test]
    fn tracker_orders_reasoning_text_and_tools() {
        let mut tracker = BlockTracker::default();
        let mut events = Vec::new();

        tracker.reasoning_delta("openai", "think".to_string(), &mut events);
        tracker.text_delta("openai", "Hi".to_string(), &mut events);
        tracker.tool_delta("openai", tool_call(0, Some("call_1"), Some("doc_view"), Some("{\"path\"")), &mut events);
        tracker.tool_delta("openai", tool_call(0, None, None, Some(":\"a.md\"}")), &mut events);
        tracker.finish("openai", &mut events);

        let stops: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CompletionEvent::BlockStop { index, block } => Some((*index, block.block_type())),
                _ => None,
            })
            .collect();
        assert_eq!(
            stops,
            [
                (0, BlockType::Thinking),
                (1, BlockType::Text),
                (2, BlockType::ToolUse)
            ]
        );

        let Some(CompletionEvent::BlockStop { block, .. }) = events.last() else {
            panic!("expected final block stop");
        };
        assert_eq!(
            block.payload,
            BlockPayload::ToolUse {
                tool_use_id: "call_1".to_string(),
                tool_name: "doc_view".to_string(),
                input: json!({"path": "a.md"}),
            }
        );
    }

    #[test]
    fn parse_frame_handles_done() {
        assert!(matches!(parse_frame("[DONE]"), Some(Frame::Done)));
        assert!(parse_frame("not json").is_none());
    }
}

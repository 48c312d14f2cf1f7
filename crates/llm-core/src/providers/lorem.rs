//! Deterministic lorem-ipsum provider.
//!
//! Streams filler text with real delays so the streaming engine can be
//! exercised end to end without network access. The model name selects the
//! behavior:
//!
//! - `lorem-slow` / `lorem-fast`: fixed word rates
//! - `lorem-cutoff`: runs past `max_tokens` and stops with `max_tokens`
//! - `lorem-tools`: calls the first custom tool before answering
//!
//! Any other `lorem-*` model streams at the configured rate.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::Result;
use crate::provider::{CompletionEvent, CompletionRequest, CompletionStream, LlmProvider};
use crate::types::{
    Block, BlockPayload, BlockType, Delta, Message, Role, StopReason, StreamDelta, Usage,
};

const NAME: &str = "lorem";
const SIGNATURE: &str = "lorem-signature";

const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "enim",
    "ad", "minim", "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi",
    "aliquip", "ex", "ea", "commodo", "consequat", "duis", "aute", "irure", "in",
    "reprehenderit", "voluptate", "velit", "esse", "cillum", "fugiat", "nulla", "pariatur",
];

/// Lorem generator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoremConfig {
    /// Default streaming rate.
    pub words_per_second: f64,
    /// Words in a normal response.
    pub response_words: usize,
    /// Words in the thinking block, when thinking is enabled.
    pub thinking_words: usize,
}

impl Default for LoremConfig {
    fn default() -> Self {
        Self {
            words_per_second: 10.0,
            response_words: 60,
            thinking_words: 10,
        }
    }
}

/// Test provider producing deterministic filler output.
#[derive(Debug, Clone, Default)]
pub struct LoremProvider {
    config: LoremConfig,
}

/// Resolved behavior for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Plan {
    delay: Duration,
    words: usize,
    truncated: bool,
    thinking_words: usize,
    call_tool: bool,
}

impl LoremProvider {
    #[must_use]
    pub const fn new(config: LoremConfig) -> Self {
        Self { config }
    }

    fn plan(&self, request: &CompletionRequest) -> Plan {
        let model = request.model.as_str();
        let rate = if model.contains("slow") {
            2.0
        } else if model.contains("fast") {
            30.0
        } else {
            self.config.words_per_second
        };
        let delay = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };

        let max_words = usize::try_from(request.params.max_tokens).unwrap_or(usize::MAX);
        let wanted = if model.contains("cutoff") || model.contains("small") {
            max_words.saturating_add(self.config.response_words)
        } else {
            self.config.response_words
        };

        Plan {
            delay,
            words: wanted.min(max_words),
            truncated: wanted > max_words,
            thinking_words: if request.params.thinking {
                self.config.thinking_words
            } else {
                0
            },
            call_tool: model.contains("tools") && !answered_tool_call(&request.messages),
        }
    }
}

/// Whether the last message already carries tool results.
fn answered_tool_call(messages: &[Message]) -> bool {
    messages.last().is_some_and(|m| {
        m.role == Role::User
            && m.blocks
                .iter()
                .any(|b| b.block_type() == BlockType::ToolResult)
    })
}

/// The `i`th word of the generated text, with leading separator.
fn word(i: usize) -> String {
    let w = WORDS[i % WORDS.len()];
    if i == 0 {
        let mut chars = w.chars();
        chars.next().map_or_else(String::new, |c| {
            c.to_uppercase().chain(chars).collect()
        })
    } else {
        format!(" {w}")
    }
}

/// Generate a placeholder input from a JSON schema's required string fields.
fn sample_input(schema: Option<&Value>) -> Value {
    let mut input = serde_json::Map::new();
    let required = schema
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for field in required.iter().filter_map(Value::as_str) {
        input.insert(field.to_string(), json!(WORDS[0]));
    }
    Value::Object(input)
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl LlmProvider for LoremProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let plan = self.plan(&request);
        let tool = plan
            .call_tool
            .then(|| request.params.tools.iter().find(|t| !t.is_builtin()).cloned())
            .flatten();
        let input_tokens = to_u32(
            request
                .messages
                .iter()
                .map(|m| m.text().split_whitespace().count())
                .sum(),
        );
        let model = request.model;

        tracing::debug!(model = %model, words = plan.words, "lorem stream");

        let stream = async_stream::stream! {
            let mut index = 0_u32;
            let mut output_words = 0_usize;

            if plan.thinking_words > 0 {
                yield Ok(CompletionEvent::BlockStart { index, block_type: BlockType::Thinking });
                let mut text = String::new();
                for i in 0..plan.thinking_words {
                    tokio::time::sleep(plan.delay).await;
                    let w = word(i);
                    text.push_str(&w);
                    yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::ThinkingDelta { text: w })));
                }
                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::SignatureDelta {
                    signature: SIGNATURE.to_string(),
                })));
                yield Ok(CompletionEvent::BlockStop {
                    index,
                    block: Block::new(BlockPayload::Thinking { text })
                        .with_provider(NAME, Some(json!({"signature": SIGNATURE}))),
                });
                output_words += plan.thinking_words;
                index += 1;
            }

            if let Some(tool) = tool {
                let id = format!("toolu_lorem_{}", uuid::Uuid::new_v4().simple());
                let input = sample_input(tool.input_schema.as_ref());
                yield Ok(CompletionEvent::BlockStart { index, block_type: BlockType::ToolUse });
                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::ToolCallStart {
                    tool_use_id: id.clone(),
                    tool_name: tool.name.clone(),
                })));
                tokio::time::sleep(plan.delay).await;
                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::JsonDelta { json: input.to_string() })));
                yield Ok(CompletionEvent::BlockStop {
                    index,
                    block: Block::tool_use(id, tool.name, input).with_provider(NAME, None),
                });
                yield Ok(CompletionEvent::Done {
                    model: Some(model),
                    stop_reason: StopReason::ToolUse,
                    usage: Usage { input_tokens, output_tokens: to_u32(output_words + 1) },
                    metadata: Some(json!({"mock": true, "provider": NAME})),
                });
                return;
            }

            yield Ok(CompletionEvent::BlockStart { index, block_type: BlockType::Text });
            let mut text = String::new();
            for i in 0..plan.words {
                tokio::time::sleep(plan.delay).await;
                let w = word(i);
                text.push_str(&w);
                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::TextDelta { text: w })));
            }
            if !plan.truncated {
                text.push('.');
                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::TextDelta { text: ".".to_string() })));
            }
            output_words += plan.words;

            // Usage rides on the text block while it is still open.
            let usage = Usage { input_tokens, output_tokens: to_u32(output_words) };
            yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::UsageDelta {
                input_tokens: Some(usage.input_tokens),
                output_tokens: Some(usage.output_tokens),
            })));
            yield Ok(CompletionEvent::BlockStop { index, block: Block::text(text).with_provider(NAME, None) });
            yield Ok(CompletionEvent::Done {
                model: Some(model),
                stop_reason: if plan.truncated { StopReason::MaxTokens } else { StopReason::EndTurn },
                usage,
                metadata: Some(json!({"mock": true, "provider": NAME})),
            });
        };

        Ok(Box::pin(stream))
    }
}

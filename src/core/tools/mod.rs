//! Tool execution for model-requested calls.
//!
//! Custom tools are executed here and never by the provider. Built-in tools
//! are declared by name only and run upstream.

pub mod documents;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use llm_core::{Block, BlockPayload, ToolDefinition};
use serde_json::{Value, json};

pub use documents::{DocSearchTool, DocTreeTool, DocViewTool};

/// Built-in tools advertised to providers by name.
pub const BUILTIN_TOOLS: &[&str] = &["web_search"];

/// A tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and input schema sent to the provider.
    fn definition(&self) -> ToolDefinition;

    /// Run the tool with the model's structured input.
    async fn execute(&self, input: Value) -> anyhow::Result<Value>;
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    /// Extract a call from a `tool_use` block.
    #[must_use]
    pub fn from_block(block: &Block) -> Option<Self> {
        match &block.payload {
            BlockPayload::ToolUse {
                tool_use_id,
                tool_name,
                input,
            } => Some(Self {
                id: tool_use_id.clone(),
                name: tool_name.clone(),
                input: input.clone(),
            }),
            _ => None,
        }
    }

    /// Error result for this call without running it.
    #[must_use]
    pub fn error_result(&self, message: &str) -> Block {
        Block::tool_result(&self.id, Some(self.name.clone()), json!(message), true)
    }
}

/// Registered tool implementations, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    builtins: Vec<String>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the document tools over `root` and the built-in tools.
    #[must_use]
    pub fn with_documents(root: impl Into<std::path::PathBuf>) -> Self {
        let root = root.into();
        let mut registry = Self::new();
        registry.register(DocTreeTool::new(root.clone()));
        registry.register(DocViewTool::new(root.clone()));
        registry.register(DocSearchTool::new(root));
        for name in BUILTIN_TOOLS {
            registry.declare_builtin(*name);
        }
        registry
    }

    /// Register a custom tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.definition().name;
        self.tools.insert(name, Arc::new(tool));
    }

    /// Declare a provider-side tool by name.
    pub fn declare_builtin(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.builtins.contains(&name) {
            self.builtins.push(name);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.builtins.is_empty()
    }

    /// Definitions to send with a request, custom tools sorted by name first.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.extend(self.builtins.iter().map(ToolDefinition::builtin));
        defs
    }

    /// Execute one call. Failures become error results.
    pub async fn execute(&self, call: &ToolCall, timeout: Duration) -> Block {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested unknown tool");
            return call.error_result(&format!("tool not found: {}", call.name));
        };

        tracing::debug!(tool = %call.name, tool_use_id = %call.id, "executing tool");
        match tokio::time::timeout(timeout, tool.execute(call.input.clone())).await {
            Ok(Ok(content)) => {
                Block::tool_result(&call.id, Some(call.name.clone()), content, false)
            }
            Ok(Err(e)) => {
                tracing::debug!(tool = %call.name, error = %e, "tool failed");
                call.error_result(&e.to_string())
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                call.error_result(&format!("tool timed out after {}s", timeout.as_secs()))
            }
        }
    }

    /// Execute calls concurrently. Results keep the order of `calls`.
    pub async fn execute_calls(&self, calls: &[ToolCall], timeout: Duration) -> Vec<Block> {
        join_all(calls.iter().map(|call| self.execute(call, timeout))).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("builtins", &self.builtins)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::custom("echo", "Echo the input", json!({"type": "object"}))
        }

        async fn execute(&self, input: Value) -> anyhow::Result<Value> {
            Ok(input)
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Tool for Sleepy {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::custom("sleepy", "Sleep then answer", json!({"type": "object"}))
        }

        async fn execute(&self, _input: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(self.0).await;
            Ok(json!("awake"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::custom("broken", "Always fails", json!({"type": "object"}))
        }

        async fn execute(&self, _input: Value) -> anyhow::Result<Value> {
            anyhow::bail!("disk on fire")
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({"id": id}),
        }
    }

    fn result_of(block: &Block) -> (&str, bool, &Value) {
        match &block.payload {
            BlockPayload::ToolResult {
                tool_use_id,
                is_error,
                content,
                ..
            } => (tool_use_id, *is_error, content),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_keep_call_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Sleepy(Duration::from_millis(30)));

        let calls = [call("a", "sleepy"), call("b", "echo"), call("c", "sleepy")];
        let results = registry.execute_calls(&calls, Duration::from_secs(5)).await;

        let ids: Vec<_> = results.iter().map(|b| result_of(b).0).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(result_of(&results[1]).2, &json!({"id": "b"}));
    }

    #[tokio::test]
    async fn failures_become_error_results() {
        let mut registry = ToolRegistry::new();
        registry.register(Broken);
        registry.register(Sleepy(Duration::from_secs(5)));

        let calls = [call("a", "broken"), call("b", "missing"), call("c", "sleepy")];
        let results = registry
            .execute_calls(&calls, Duration::from_millis(20))
            .await;

        let (_, is_error, content) = result_of(&results[0]);
        assert!(is_error);
        assert_eq!(content, &json!("disk on fire"));

        let (_, is_error, content) = result_of(&results[1]);
        assert!(is_error);
        assert_eq!(content, &json!("tool not found: missing"));

        let (_, is_error, content) = result_of(&results[2]);
        assert!(is_error);
        assert!(content.as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn definitions_list_builtins_last() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Broken);
        registry.declare_builtin("web_search");
        registry.declare_builtin("web_search");

        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["broken", "echo", "web_search"]);
    }

    #[test]
    fn tool_call_reads_tool_use_blocks() {
        let block = Block::tool_use("tu_1", "echo", json!({"q": 1}));
        let call = ToolCall::from_block(&block).unwrap();
        assert_eq!(call.name, "echo");
        assert!(ToolCall::from_block(&Block::text("hi")).is_none());
    }
}

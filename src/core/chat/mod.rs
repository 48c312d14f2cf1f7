//! Conversation data model: chats, turns and their blocks.
//!
//! Turns form a parent-pointer tree through `prev_turn_id`. Turns sharing a
//! parent are siblings, produced by editing or regenerating.

pub mod history;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use llm_core::{Block, Role};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use history::build_messages;

/// Maximum chat title length, including the ellipsis.
pub const MAX_TITLE_LENGTH: usize = 50;

/// Generate a new chat ID.
#[must_use]
pub fn new_chat_id() -> String {
    format!("chat_{}", Ulid::new())
}

/// Generate a new turn ID.
#[must_use]
pub fn new_turn_id() -> String {
    format!("turn_{}", Ulid::new())
}

/// Generate a new block ID.
#[must_use]
pub fn new_block_id() -> String {
    format!("blk_{}", Ulid::new())
}

/// Title derived from the first line of a user message.
#[must_use]
pub fn derive_title(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() <= MAX_TITLE_LENGTH {
        return if line.is_empty() {
            "New chat".to_string()
        } else {
            line.to_string()
        };
    }

    let budget: String = line.chars().take(MAX_TITLE_LENGTH - 3).collect();
    let cut = budget
        .rfind(char::is_whitespace)
        .filter(|&i| i > 0)
        .map_or(budget.as_str(), |i| &budget[..i]);
    format!("{}...", cut.trim_end())
}

/// A conversation container scoped to one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_viewed_turn_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Cancelled,
    Error,
}

impl TurnStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Whether no further content will be written to the turn.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "streaming" => Ok(Self::Streaming),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown turn status: {other}")),
        }
    }
}

/// One role-tagged exchange node in the conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub status: TurnStatus,
    pub prev_turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Id of the terminal event published for this turn's generation.
    #[serde(skip)]
    pub last_event_id: Option<u64>,
}

/// A persisted block: a [`Block`] at a position within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnBlock {
    pub id: String,
    pub turn_id: String,
    pub sequence: u32,
    #[serde(flatten)]
    pub block: Block,
    pub created_at: DateTime<Utc>,
    /// Id of the `block_stop` event that closed this block, when streamed.
    #[serde(skip)]
    pub event_id: Option<u64>,
}

/// Input for creating a turn.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub chat_id: String,
    pub role: Role,
    pub status: TurnStatus,
    pub prev_turn_id: Option<String>,
    pub model: Option<String>,
}

/// Usage and outcome fields recorded when a generation ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnMetadata {
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
    pub response_metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed() {
        assert!(new_chat_id().starts_with("chat_"));
        assert!(new_turn_id().starts_with("turn_"));
        assert!(new_block_id().starts_with("blk_"));
    }

    #[test]
    fn short_title_is_kept() {
        assert_eq!(derive_title("  Outline chapter two\nmore"), "Outline chapter two");
        assert_eq!(derive_title("\n\n"), "New chat");
    }

    #[test]
    fn long_title_truncates_on_word_boundary() {
        let title = derive_title(
            "Please help me restructure the second act so the reveal lands harder",
        );
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= MAX_TITLE_LENGTH);
        assert!(!title.contains("harder"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TurnStatus::Pending.is_terminal());
        assert!(!TurnStatus::Streaming.is_terminal());
        assert!(TurnStatus::Complete.is_terminal());
        assert!(TurnStatus::Cancelled.is_terminal());
        assert!(TurnStatus::Error.is_terminal());
        assert_eq!("cancelled".parse::<TurnStatus>(), Ok(TurnStatus::Cancelled));
    }
}

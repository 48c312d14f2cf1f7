//! Wire events of the per-turn event feed.

use llm_core::{Block, BlockType, ErrorKind, StreamDelta};
use serde::Serialize;
use serde_json::Value;

use crate::core::chat::TurnBlock;

/// One named event frame. Serializes to the frame's `data` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TurnEvent {
    TurnStart {
        turn_id: String,
        model: String,
    },
    BlockStart {
        block_index: u32,
        block_type: BlockType,
    },
    BlockDelta(StreamDelta),
    BlockStop {
        block_index: u32,
        /// Assembled block, kept for persistence only.
        #[serde(skip)]
        block: Option<Block>,
    },
    BlockCatchup {
        block: TurnBlock,
    },
    TurnComplete {
        turn_id: String,
        stop_reason: String,
        input_tokens: u32,
        output_tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_metadata: Option<Value>,
    },
    TurnError {
        turn_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        retryable: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_cancelled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_block_index: Option<u32>,
    },
}

impl TurnEvent {
    /// SSE event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::BlockStart { .. } => "block_start",
            Self::BlockDelta(_) => "block_delta",
            Self::BlockStop { .. } => "block_stop",
            Self::BlockCatchup { .. } => "block_catchup",
            Self::TurnComplete { .. } => "turn_complete",
            Self::TurnError { .. } => "turn_error",
        }
    }

    /// Whether this event ends the feed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::TurnError { .. })
    }

    /// Data payload as JSON text.
    #[must_use]
    pub fn data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// An event stamped with its position in the turn's feed.
///
/// Ids are decimal on the wire and strictly increasing within a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencedEvent {
    pub id: u64,
    pub event: TurnEvent,
}

#[cfg(test)]
mod tests {
    use llm_core::Delta;
    use serde_json::json;

    use super::*;

    #[test]
    fn delta_payload_is_flat() {
        let event = TurnEvent::BlockDelta(StreamDelta::new(
            1,
            Delta::ThinkingDelta {
                text: "hm".to_string(),
            },
        ));
        assert_eq!(event.name(), "block_delta");
        let data: Value = serde_json::from_str(&event.data()).unwrap();
        assert_eq!(
            data,
            json!({"block_index": 1, "delta_type": "thinking_delta", "text_delta": "hm"})
        );
    }

    #[test]
    fn block_stop_hides_assembled_block() {
        let event = TurnEvent::BlockStop {
            block_index: 3,
            block: Some(Block::text("done")),
        };
        let data: Value = serde_json::from_str(&event.data()).unwrap();
        assert_eq!(data, json!({"block_index": 3}));
    }

    #[test]
    fn cancelled_error_flags_cancellation() {
        let event = TurnEvent::TurnError {
            turn_id: "turn_1".to_string(),
            error: "cancelled".to_string(),
            error_kind: None,
            retryable: false,
            is_cancelled: true,
            last_block_index: Some(0),
        };
        assert!(event.is_terminal());
        let data: Value = serde_json::from_str(&event.data()).unwrap();
        assert_eq!(data["is_cancelled"], true);
        assert_eq!(data["last_block_index"], 0);
        assert!(data.get("error_kind").is_none());
    }
}

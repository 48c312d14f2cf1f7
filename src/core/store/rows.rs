//! Row mapping between SQLite and the conversation model.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use llm_core::{Block, BlockPayload, BlockType};
use rusqlite::Row;
use rusqlite::types::Type;
use serde_json::{Map, Value};

use crate::core::chat::{Chat, Turn, TurnBlock};
use crate::core::error::{Error, Result};

pub(super) fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        system_prompt: row.get(3)?,
        last_viewed_turn_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub(super) fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let role: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Turn {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: parse_column(2, &role)?,
        status: parse_column(3, &status)?,
        prev_turn_id: row.get(4)?,
        model: row.get(5)?,
        input_tokens: row.get(6)?,
        output_tokens: row.get(7)?,
        stop_reason: row.get(8)?,
        error: row.get(9)?,
        response_metadata: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
        last_event_id: row.get(13)?,
    })
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Raw `turn_blocks` row, decoded into a [`TurnBlock`] outside the query.
pub(super) struct BlockRow {
    id: String,
    turn_id: String,
    sequence: u32,
    block_type: String,
    text_content: Option<String>,
    content: Option<Value>,
    provider: Option<String>,
    provider_data: Option<Value>,
    created_at: DateTime<Utc>,
    event_id: Option<u64>,
}

impl BlockRow {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            turn_id: row.get(1)?,
            sequence: row.get(2)?,
            block_type: row.get(3)?,
            text_content: row.get(4)?,
            content: row.get(5)?,
            provider: row.get(6)?,
            provider_data: row.get(7)?,
            created_at: row.get(8)?,
            event_id: row.get(9)?,
        })
    }

    pub(super) fn into_turn_block(self) -> Result<TurnBlock> {
        let block_type: BlockType = self
            .block_type
            .parse()
            .map_err(Error::Validation)?;
        let payload = join_payload(block_type, self.text_content, self.content)?;
        Ok(TurnBlock {
            id: self.id,
            turn_id: self.turn_id,
            sequence: self.sequence,
            block: Block {
                payload,
                provider: self.provider,
                provider_data: self.provider_data,
            },
            created_at: self.created_at,
            event_id: self.event_id,
        })
    }
}

/// Split a payload into its `text_content` and `content` columns.
pub(super) fn split_payload(payload: &BlockPayload) -> Result<(Option<String>, Option<Value>)> {
    Ok(match payload {
        BlockPayload::Text { text } | BlockPayload::Thinking { text } => (Some(text.clone()), None),
        BlockPayload::Image { content }
        | BlockPayload::Reference { content }
        | BlockPayload::PartialReference { content } => (None, Some(content.clone())),
        structured => {
            let mut value = serde_json::to_value(structured)?;
            if let Some(object) = value.as_object_mut() {
                object.remove("block_type");
            }
            (None, Some(value))
        }
    })
}

fn join_payload(
    block_type: BlockType,
    text: Option<String>,
    content: Option<Value>,
) -> Result<BlockPayload> {
    let opaque = content.clone().unwrap_or(Value::Null);
    Ok(match block_type {
        BlockType::Text => BlockPayload::Text {
            text: text.unwrap_or_default(),
        },
        BlockType::Thinking => BlockPayload::Thinking {
            text: text.unwrap_or_default(),
        },
        BlockType::Image => BlockPayload::Image { content: opaque },
        BlockType::Reference => BlockPayload::Reference { content: opaque },
        BlockType::PartialReference => BlockPayload::PartialReference { content: opaque },
        BlockType::ToolUse
        | BlockType::ToolResult
        | BlockType::WebSearchUse
        | BlockType::WebSearchResult => {
            let mut object = match content {
                Some(Value::Object(object)) => object,
                _ => Map::new(),
            };
            object.insert(
                "block_type".to_string(),
                Value::String(block_type.as_str().to_string()),
            );
            serde_json::from_value(Value::Object(object))?
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn structured_payload_round_trips_through_columns() {
        let payload = Block::tool_result("t1", Some("doc_view".into()), json!({"a": 1}), true).payload;
        let (text, content) = split_payload(&payload).unwrap();
        assert!(text.is_none());
        assert_eq!(content.as_ref().unwrap()["tool_use_id"], "t1");
        assert!(content.as_ref().unwrap().get("block_type").is_none());

        let back = join_payload(BlockType::ToolResult, text, content).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn opaque_content_is_stored_verbatim() {
        let payload = BlockPayload::Reference {
            content: json!({"document_id": "doc_1"}),
        };
        let (_, content) = split_payload(&payload).unwrap();
        assert_eq!(content, Some(json!({"document_id": "doc_1"})));
    }
}

//! Rebuild provider message history from a turn path.

use std::collections::{HashMap, HashSet};

use llm_core::{Block, BlockPayload, BlockType, Message, Role};
use serde_json::json;

use super::{Turn, TurnBlock, TurnStatus};

/// Result content injected for tool calls that never got an answer.
const INTERRUPTED_TOOL_RESULT: &str = "Tool execution was interrupted before a result was recorded";

/// Build normalized messages for a root-to-node path of turns.
///
/// Assistant turns store their tool results inline, so each one is split at
/// `tool_result` runs into alternating assistant and user messages. Turns
/// still pending or streaming are skipped. Tool calls with no result are
/// answered with a synthetic error so the history stays well-formed.
#[must_use]
pub fn build_messages(path: &[Turn], blocks: &HashMap<String, Vec<TurnBlock>>) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();

    for turn in path {
        if matches!(turn.status, TurnStatus::Pending | TurnStatus::Streaming) {
            continue;
        }
        let Some(turn_blocks) = blocks.get(&turn.id) else {
            continue;
        };

        match turn.role {
            Role::User => push(
                &mut messages,
                Role::User,
                turn_blocks.iter().map(|b| b.block.clone()).collect(),
            ),
            Role::Assistant => {
                let mut pending: Vec<Block> = Vec::new();
                let mut in_results = false;
                for tb in turn_blocks {
                    let is_result = tb.block.block_type() == BlockType::ToolResult;
                    if is_result != in_results && !pending.is_empty() {
                        let role = if in_results { Role::User } else { Role::Assistant };
                        push(&mut messages, role, std::mem::take(&mut pending));
                    }
                    in_results = is_result;
                    pending.push(tb.block.clone());
                }
                let role = if in_results { Role::User } else { Role::Assistant };
                push(&mut messages, role, pending);
            }
        }
    }

    repair_dangling_tool_calls(&mut messages);
    messages
}

/// Append blocks, merging with the previous message when roles match.
fn push(messages: &mut Vec<Message>, role: Role, blocks: Vec<Block>) {
    if blocks.is_empty() {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == role => last.blocks.extend(blocks),
        _ => messages.push(Message::new(role, blocks)),
    }
}

/// Answer every unanswered `tool_use` with an error result.
fn repair_dangling_tool_calls(messages: &mut Vec<Message>) {
    let mut i = 0;
    while i < messages.len() {
        if messages[i].role != Role::Assistant {
            i += 1;
            continue;
        }

        let calls: Vec<(String, String)> = messages[i]
            .blocks
            .iter()
            .filter_map(|b| match &b.payload {
                BlockPayload::ToolUse {
                    tool_use_id,
                    tool_name,
                    ..
                } => Some((tool_use_id.clone(), tool_name.clone())),
                _ => None,
            })
            .collect();
        if calls.is_empty() {
            i += 1;
            continue;
        }

        let answered: HashSet<String> = messages
            .get(i + 1)
            .filter(|m| m.role == Role::User)
            .map(|m| {
                m.blocks
                    .iter()
                    .filter_map(|b| match &b.payload {
                        BlockPayload::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let missing: Vec<Block> = calls
            .into_iter()
            .filter(|(id, _)| !answered.contains(id))
            .map(|(id, name)| {
                Block::tool_result(id, Some(name), json!(INTERRUPTED_TOOL_RESULT), true)
            })
            .collect();

        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), "answering dangling tool calls");
            match messages.get_mut(i + 1) {
                Some(next) if next.role == Role::User => {
                    // Results must lead the user message
                    let rest = std::mem::replace(&mut next.blocks, missing);
                    next.blocks.extend(rest);
                }
                _ => messages.insert(i + 1, Message::new(Role::User, missing)),
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn turn(id: &str, role: Role, status: TurnStatus) -> Turn {
        Turn {
            id: id.to_string(),
            chat_id: "chat_1".to_string(),
            role,
            status,
            prev_turn_id: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
            error: None,
            response_metadata: None,
            created_at: Utc::now(),
            completed_at: None,
            last_event_id: None,
        }
    }

    fn blocks_of(turn_id: &str, blocks: Vec<Block>) -> Vec<TurnBlock> {
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| TurnBlock {
                id: format!("blk_{turn_id}_{i}"),
                turn_id: turn_id.to_string(),
                sequence: u32::try_from(i).unwrap(),
                block,
                created_at: Utc::now(),
                event_id: None,
            })
            .collect()
    }

    #[test]
    fn assistant_turn_splits_at_tool_results() {
        let path = vec![
            turn("u1", Role::User, TurnStatus::Complete),
            turn("a1", Role::Assistant, TurnStatus::Complete),
        ];
        let mut blocks = HashMap::new();
        blocks.insert("u1".to_string(), blocks_of("u1", vec![Block::text("find it")]));
        blocks.insert(
            "a1".to_string(),
            blocks_of(
                "a1",
                vec![
                    Block::text("Looking."),
                    Block::tool_use("t1", "doc_search", json!({"query": "x"})),
                    Block::tool_result("t1", Some("doc_search".into()), json!("hit"), false),
                    Block::text("Found it."),
                ],
            ),
        );

        let messages = build_messages(&path, &blocks);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(messages[1].blocks.len(), 2);
        assert_eq!(messages[3].text(), "Found it.");
    }

    #[test]
    fn dangling_tool_use_gets_error_result() {
        let path = vec![
            turn("u1", Role::User, TurnStatus::Complete),
            turn("a1", Role::Assistant, TurnStatus::Cancelled),
            turn("u2", Role::User, TurnStatus::Complete),
        ];
        let mut blocks = HashMap::new();
        blocks.insert("u1".to_string(), blocks_of("u1", vec![Block::text("go")]));
        blocks.insert(
            "a1".to_string(),
            blocks_of("a1", vec![Block::tool_use("t1", "doc_view", json!({}))]),
        );
        blocks.insert("u2".to_string(), blocks_of("u2", vec![Block::text("again")]));

        let messages = build_messages(&path, &blocks);
        assert_eq!(messages.len(), 3);
        let BlockPayload::ToolResult {
            tool_use_id,
            is_error,
            ..
        } = &messages[2].blocks[0].payload
        else {
            panic!("expected synthetic tool result first");
        };
        assert_eq!(tool_use_id, "t1");
        assert!(is_error);
        assert_eq!(messages[2].text(), "again");
    }

    #[test]
    fn streaming_turns_are_skipped() {
        let path = vec![
            turn("u1", Role::User, TurnStatus::Complete),
            turn("a1", Role::Assistant, TurnStatus::Streaming),
        ];
        let mut blocks = HashMap::new();
        blocks.insert("u1".to_string(), blocks_of("u1", vec![Block::text("hi")]));
        blocks.insert("a1".to_string(), blocks_of("a1", vec![Block::text("partial")]));

        let messages = build_messages(&path, &blocks);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}

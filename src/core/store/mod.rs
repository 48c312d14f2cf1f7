//! SQLite-backed conversation store.
//!
//! Owns the turn tree: chats, turns linked through `prev_turn_id`, and the
//! ordered blocks of each turn. Every write that touches one turn and its
//! blocks runs in a single transaction.
//!
//! All SQL lives in `sql/*.sql` files, loaded via `include_str!`.

mod rows;

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use llm_core::{Block, Role};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};

use self::rows::{BlockRow, chat_from_row, split_payload, turn_from_row};
use super::chat::{
    Chat, NewTurn, Turn, TurnBlock, TurnMetadata, TurnStatus, new_block_id, new_chat_id,
    new_turn_id,
};
use super::error::{Error, Result};

const SQL_SCHEMA: &str = include_str!("sql/schema.sql");
const SQL_INSERT_CHAT: &str = include_str!("sql/insert_chat.sql");
const SQL_SELECT_CHAT: &str = include_str!("sql/select_chat.sql");
const SQL_SELECT_CHATS: &str = include_str!("sql/select_chats.sql");
const SQL_UPDATE_CHAT: &str = include_str!("sql/update_chat.sql");
const SQL_UPDATE_LAST_VIEWED: &str = include_str!("sql/update_last_viewed.sql");
const SQL_TOUCH_CHAT: &str = include_str!("sql/touch_chat.sql");
const SQL_DELETE_CHAT: &str = include_str!("sql/delete_chat.sql");
const SQL_INSERT_TURN: &str = include_str!("sql/insert_turn.sql");
const SQL_SELECT_TURN: &str = include_str!("sql/select_turn.sql");
const SQL_SELECT_ROOT_TURNS: &str = include_str!("sql/select_root_turns.sql");
const SQL_SELECT_LATEST_CHILD: &str = include_str!("sql/select_latest_child.sql");
const SQL_SELECT_LATEST_LEAF: &str = include_str!("sql/select_latest_leaf.sql");
const SQL_SELECT_PATH: &str = include_str!("sql/select_path.sql");
const SQL_SELECT_SIBLINGS: &str = include_str!("sql/select_siblings.sql");
const SQL_UPDATE_TURN_STATUS: &str = include_str!("sql/update_turn_status.sql");
const SQL_UPDATE_TURN_METADATA: &str = include_str!("sql/update_turn_metadata.sql");
const SQL_UPDATE_TURN_ERROR: &str = include_str!("sql/update_turn_error.sql");
const SQL_UPDATE_LAST_EVENT_ID: &str = include_str!("sql/update_last_event_id.sql");
const SQL_FAIL_STALE_TURNS: &str = include_str!("sql/fail_stale_turns.sql");
const SQL_NEXT_SEQUENCE: &str = include_str!("sql/next_sequence.sql");
const SQL_UPSERT_BLOCK: &str = include_str!("sql/upsert_block.sql");
const SQL_SELECT_BLOCKS: &str = include_str!("sql/select_blocks.sql");
const SQL_SELECT_BLOCKS_BATCH: &str = include_str!("sql/select_blocks_batch.sql");

/// Direction of a history page relative to its anchor turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    /// Ancestors up to and including the anchor.
    Before,
    /// Descendants after the anchor, following the newest child.
    After,
    /// Both sides, anchor included.
    #[default]
    Both,
}

/// One page of a chat's active branch, ordered root to leaf.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnPage {
    pub turns: Vec<Turn>,
    pub has_more_before: bool,
    pub has_more_after: bool,
}

/// Where a new exchange lands.
#[derive(Debug, Clone)]
pub enum ChatTarget {
    /// Append to an existing chat.
    Existing(String),
    /// Create the chat in the same transaction.
    New {
        project_id: String,
        system_prompt: Option<String>,
    },
}

/// A user message plus the assistant turn that will answer it.
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub target: ChatTarget,
    pub prev_turn_id: Option<String>,
    pub user_blocks: Vec<Block>,
    pub model: String,
}

/// Rows written by [`ConversationStore::create_exchange`].
#[derive(Debug, Clone)]
pub struct Exchange {
    pub chat: Chat,
    pub user_turn: Turn,
    pub assistant_turn: Turn,
}

/// A block to write at an explicit position in its turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBlock {
    pub sequence: u32,
    /// Id of the `block_stop` event that published the block, if streamed.
    pub event_id: Option<u64>,
    pub block: Block,
}

impl StagedBlock {
    #[must_use]
    pub fn new(sequence: u32, block: Block) -> Self {
        Self {
            sequence,
            event_id: None,
            block,
        }
    }

    #[must_use]
    pub fn with_event_id(mut self, event_id: u64) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

/// Everything written when a turn reaches a terminal status.
#[derive(Debug, Clone)]
pub struct Finalize {
    pub status: TurnStatus,
    /// Blocks not yet persisted, including interrupted text, at their
    /// sequences.
    pub blocks: Vec<StagedBlock>,
    pub metadata: TurnMetadata,
    pub error: Option<String>,
    /// Id the terminal event will carry on the live feed.
    pub terminal_event_id: Option<u64>,
}

/// SQLite conversation store.
///
/// Wraps a `rusqlite::Connection` in a `Mutex` for thread safety.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::debug!(path = %path.display(), "opened conversation store");
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SQL_SCHEMA)?;
        Ok(())
    }

    // Chats

    pub fn create_chat(
        &self,
        project_id: &str,
        title: &str,
        system_prompt: Option<&str>,
    ) -> Result<Chat> {
        let conn = self.conn.lock();
        insert_chat(&conn, project_id, title, system_prompt)
    }

    /// Fetch a chat that has not been deleted.
    pub fn get_chat(&self, chat_id: &str) -> Result<Chat> {
        let conn = self.conn.lock();
        select_chat(&conn, chat_id)
    }

    /// Chats of a project, most recently updated first.
    pub fn list_chats(&self, project_id: &str) -> Result<Vec<Chat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(SQL_SELECT_CHATS)?;
        let chats = stmt
            .query_map([project_id], chat_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chats)
    }

    /// Update title and/or system prompt; `None` leaves a field unchanged.
    pub fn update_chat(
        &self,
        chat_id: &str,
        title: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<Chat> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            SQL_UPDATE_CHAT,
            params![chat_id, title, system_prompt, Utc::now()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("chat", chat_id));
        }
        select_chat(&conn, chat_id)
    }

    pub fn set_last_viewed_turn(&self, chat_id: &str, turn_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let turn = select_turn(&conn, turn_id)?;
        if turn.chat_id != chat_id {
            return Err(Error::Validation(format!(
                "turn {turn_id} does not belong to chat {chat_id}"
            )));
        }
        if conn.execute(SQL_UPDATE_LAST_VIEWED, params![chat_id, turn_id])? == 0 {
            return Err(Error::not_found("chat", chat_id));
        }
        Ok(())
    }

    /// Soft-delete a chat. Its turns stay on disk.
    pub fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute(SQL_DELETE_CHAT, params![chat_id, Utc::now()])? == 0 {
            return Err(Error::not_found("chat", chat_id));
        }
        Ok(())
    }

    // Turns

    /// Create a turn after validating its chat and parent.
    pub fn create_turn(&self, new: &NewTurn) -> Result<Turn> {
        let conn = self.conn.lock();
        insert_turn(&conn, new)
    }

    /// Create a turn and its initial blocks in one transaction.
    pub fn create_turn_with_blocks(
        &self,
        new: &NewTurn,
        blocks: &[Block],
    ) -> Result<(Turn, Vec<TurnBlock>)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let turn = insert_turn(&tx, new)?;
        let written = insert_blocks(&tx, &turn.id, 0, blocks)?;
        tx.commit()?;
        Ok((turn, written))
    }

    /// Write a user turn and a pending assistant turn, creating the chat first
    /// when the target is new. Nothing is written if any step fails.
    pub fn create_exchange(&self, exchange: &NewExchange) -> Result<Exchange> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let chat = match &exchange.target {
            ChatTarget::Existing(chat_id) => select_chat(&tx, chat_id)?,
            ChatTarget::New {
                project_id,
                system_prompt,
            } => {
                let text: String = exchange
                    .user_blocks
                    .iter()
                    .filter_map(Block::text_content)
                    .collect();
                let title = super::chat::derive_title(&text);
                insert_chat(&tx, project_id, &title, system_prompt.as_deref())?
            }
        };

        let user_turn = insert_turn(
            &tx,
            &NewTurn {
                chat_id: chat.id.clone(),
                role: Role::User,
                status: TurnStatus::Complete,
                prev_turn_id: exchange.prev_turn_id.clone(),
                model: None,
            },
        )?;
        insert_blocks(&tx, &user_turn.id, 0, &exchange.user_blocks)?;
        tx.execute(
            SQL_UPDATE_TURN_STATUS,
            params![user_turn.id, TurnStatus::Complete.as_str(), Utc::now()],
        )?;

        let assistant_turn = insert_turn(
            &tx,
            &NewTurn {
                chat_id: chat.id.clone(),
                role: Role::Assistant,
                status: TurnStatus::Pending,
                prev_turn_id: Some(user_turn.id.clone()),
                model: Some(exchange.model.clone()),
            },
        )?;
        tx.execute(
            SQL_UPDATE_LAST_VIEWED,
            params![chat.id, assistant_turn.id],
        )?;

        let user_turn = select_turn(&tx, &user_turn.id)?;
        tx.commit()?;

        tracing::debug!(
            chat_id = %chat.id,
            user_turn = %user_turn.id,
            assistant_turn = %assistant_turn.id,
            "created exchange"
        );
        Ok(Exchange {
            chat,
            user_turn,
            assistant_turn,
        })
    }

    pub fn get_turn(&self, turn_id: &str) -> Result<Turn> {
        let conn = self.conn.lock();
        select_turn(&conn, turn_id)
    }

    /// Turns of a chat with no parent.
    pub fn root_turns(&self, chat_id: &str) -> Result<Vec<Turn>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(SQL_SELECT_ROOT_TURNS)?;
        let turns = stmt
            .query_map([chat_id], turn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    /// Set the status; terminal statuses also stamp `completed_at`.
    pub fn update_turn_status(&self, turn_id: &str, status: TurnStatus) -> Result<()> {
        let conn = self.conn.lock();
        set_status(&conn, turn_id, status)
    }

    /// Record model, usage and stop reason. `None` fields are left as they are.
    pub fn update_turn_metadata(&self, turn_id: &str, metadata: &TurnMetadata) -> Result<()> {
        let conn = self.conn.lock();
        set_metadata(&conn, turn_id, metadata)
    }

    /// Mark a turn failed with the given message.
    pub fn update_turn_error(&self, turn_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute(SQL_UPDATE_TURN_ERROR, params![turn_id, error, Utc::now()])? == 0 {
            return Err(Error::not_found("turn", turn_id));
        }
        Ok(())
    }

    /// Mark turns left pending or streaming by a previous process as failed.
    pub fn fail_stale_turns(&self, message: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(SQL_FAIL_STALE_TURNS, params![message, Utc::now()])?)
    }

    /// Root-to-node path ending at `turn_id`.
    pub fn turn_path(&self, turn_id: &str) -> Result<Vec<Turn>> {
        let conn = self.conn.lock();
        select_path(&conn, turn_id)
    }

    /// IDs of every turn sharing this turn's parent, the turn included.
    pub fn sibling_ids(&self, turn_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        select_siblings(&conn, turn_id)
    }

    /// Sibling IDs for a batch of turns.
    pub fn siblings_for_turns(&self, turn_ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let conn = self.conn.lock();
        turn_ids
            .iter()
            .map(|id| Ok((id.clone(), select_siblings(&conn, id)?)))
            .collect()
    }

    /// A page of the chat's active branch around an anchor turn.
    ///
    /// The anchor defaults to the chat's last viewed turn, then to its newest
    /// leaf. Walking forward follows the most recently created child.
    pub fn paginated_turns(
        &self,
        chat_id: &str,
        from_turn_id: Option<&str>,
        direction: PageDirection,
        limit: usize,
    ) -> Result<TurnPage> {
        let conn = self.conn.lock();
        let chat = select_chat(&conn, chat_id)?;
        let limit = limit.max(1);

        let anchor = match from_turn_id.map(str::to_string).or(chat.last_viewed_turn_id) {
            Some(id) => Some(id),
            None => conn
                .query_row(SQL_SELECT_LATEST_LEAF, [chat_id], |row| row.get(0))
                .optional()?,
        };
        let Some(anchor) = anchor else {
            return Ok(TurnPage::default());
        };
        let anchor_turn = select_turn(&conn, &anchor)?;
        if anchor_turn.chat_id != chat_id {
            return Err(Error::Validation(format!(
                "turn {anchor} does not belong to chat {chat_id}"
            )));
        }

        let mut page = TurnPage::default();
        if direction != PageDirection::After {
            let path = select_path(&conn, &anchor)?;
            let skip = path.len().saturating_sub(limit);
            page.has_more_before = skip > 0;
            page.turns.extend(path.into_iter().skip(skip));
        }

        if direction != PageDirection::Before {
            let mut cursor = anchor;
            let mut after = 0;
            while let Some(child) = latest_child(&conn, chat_id, &cursor)? {
                if after == limit {
                    page.has_more_after = true;
                    break;
                }
                cursor = child.id.clone();
                page.turns.push(child);
                after += 1;
            }
        }

        Ok(page)
    }

    // Blocks

    /// Append blocks after the turn's last sequence.
    pub fn append_blocks(&self, turn_id: &str, blocks: &[Block]) -> Result<Vec<TurnBlock>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        select_turn(&tx, turn_id)?;
        let next: u32 = tx.query_row(SQL_NEXT_SEQUENCE, [turn_id], |row| row.get(0))?;
        let written = insert_blocks(&tx, turn_id, next, blocks)?;
        tx.commit()?;
        Ok(written)
    }

    /// Write blocks at explicit sequences.
    ///
    /// Rewriting an existing sequence replaces its content, so retrying a
    /// failed commit never duplicates rows. A sequence past the next free
    /// slot is rejected.
    pub fn write_blocks(&self, turn_id: &str, blocks: &[StagedBlock]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        select_turn(&tx, turn_id)?;
        upsert_blocks(&tx, turn_id, blocks)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist the partial text of an interrupted block.
    ///
    /// Keyed by `(turn_id, sequence)`: repeated flushes update the same row.
    pub fn upsert_partial_text(&self, turn_id: &str, sequence: u32, text: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        select_turn(&tx, turn_id)?;
        upsert_blocks(&tx, turn_id, &[StagedBlock::new(sequence, Block::text(text))])?;
        tx.commit()?;
        Ok(())
    }

    /// Write remaining blocks, metadata and terminal status in one
    /// transaction. Nothing is written if any part fails.
    pub fn finalize_turn(&self, turn_id: &str, finalize: &Finalize) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let turn = select_turn(&tx, turn_id)?;

        upsert_blocks(&tx, turn_id, &finalize.blocks)?;
        set_metadata(&tx, turn_id, &finalize.metadata)?;
        if let Some(event_id) = finalize.terminal_event_id {
            tx.execute(SQL_UPDATE_LAST_EVENT_ID, params![turn_id, event_id])?;
        }
        match (&finalize.error, finalize.status) {
            (Some(error), TurnStatus::Error) => {
                tx.execute(SQL_UPDATE_TURN_ERROR, params![turn_id, error, Utc::now()])?;
            }
            (_, status) => set_status(&tx, turn_id, status)?,
        }
        tx.execute(SQL_TOUCH_CHAT, params![turn.chat_id, Utc::now()])?;
        tx.commit()?;
        Ok(())
    }

    /// Blocks of one turn in sequence order.
    pub fn turn_blocks(&self, turn_id: &str) -> Result<Vec<TurnBlock>> {
        let conn = self.conn.lock();
        select_blocks(&conn, turn_id)
    }

    /// Blocks for many turns in one query, grouped by turn.
    pub fn blocks_for_turns(&self, turn_ids: &[String]) -> Result<HashMap<String, Vec<TurnBlock>>> {
        let mut grouped: HashMap<String, Vec<TurnBlock>> =
            turn_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        if turn_ids.is_empty() {
            return Ok(grouped);
        }

        let placeholders = vec!["?"; turn_ids.len()].join(", ");
        let sql = SQL_SELECT_BLOCKS_BATCH.replace("{ids}", &placeholders);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(turn_ids.iter()), BlockRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for row in rows {
            let block = row.into_turn_block()?;
            grouped.entry(block.turn_id.clone()).or_default().push(block);
        }
        Ok(grouped)
    }
}

fn insert_chat(
    conn: &Connection,
    project_id: &str,
    title: &str,
    system_prompt: Option<&str>,
) -> Result<Chat> {
    if project_id.trim().is_empty() {
        return Err(Error::Validation("project_id must not be empty".to_string()));
    }
    let id = new_chat_id();
    conn.execute(
        SQL_INSERT_CHAT,
        params![id, project_id, title, system_prompt, Utc::now()],
    )?;
    select_chat(conn, &id)
}

fn select_chat(conn: &Connection, chat_id: &str) -> Result<Chat> {
    conn.query_row(SQL_SELECT_CHAT, [chat_id], chat_from_row)
        .optional()?
        .ok_or_else(|| Error::not_found("chat", chat_id))
}

fn insert_turn(conn: &Connection, new: &NewTurn) -> Result<Turn> {
    select_chat(conn, &new.chat_id)?;
    if let Some(prev) = &new.prev_turn_id {
        let parent = select_turn(conn, prev)?;
        if parent.chat_id != new.chat_id {
            return Err(Error::Validation(format!(
                "turn {prev} does not belong to chat {}",
                new.chat_id
            )));
        }
    }

    let id = new_turn_id();
    let now = Utc::now();
    conn.execute(
        SQL_INSERT_TURN,
        params![
            id,
            new.chat_id,
            new.prev_turn_id,
            new.role.as_str(),
            new.status.as_str(),
            new.model,
            now
        ],
    )?;
    conn.execute(SQL_TOUCH_CHAT, params![new.chat_id, now])?;
    select_turn(conn, &id)
}

fn select_turn(conn: &Connection, turn_id: &str) -> Result<Turn> {
    conn.query_row(SQL_SELECT_TURN, [turn_id], turn_from_row)
        .optional()?
        .ok_or_else(|| Error::not_found("turn", turn_id))
}

fn latest_child(conn: &Connection, chat_id: &str, turn_id: &str) -> Result<Option<Turn>> {
    Ok(conn
        .query_row(
            SQL_SELECT_LATEST_CHILD,
            params![chat_id, turn_id],
            turn_from_row,
        )
        .optional()?)
}

fn select_path(conn: &Connection, turn_id: &str) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare(SQL_SELECT_PATH)?;
    let path = stmt
        .query_map([turn_id], turn_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if path.is_empty() {
        return Err(Error::not_found("turn", turn_id));
    }
    Ok(path)
}

fn select_siblings(conn: &Connection, turn_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(SQL_SELECT_SIBLINGS)?;
    let ids = stmt
        .query_map([turn_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    if ids.is_empty() {
        return Err(Error::not_found("turn", turn_id));
    }
    Ok(ids)
}

fn set_status(conn: &Connection, turn_id: &str, status: TurnStatus) -> Result<()> {
    let completed_at = status.is_terminal().then(Utc::now);
    if conn.execute(
        SQL_UPDATE_TURN_STATUS,
        params![turn_id, status.as_str(), completed_at],
    )? == 0
    {
        return Err(Error::not_found("turn", turn_id));
    }
    Ok(())
}

fn set_metadata(conn: &Connection, turn_id: &str, metadata: &TurnMetadata) -> Result<()> {
    conn.execute(
        SQL_UPDATE_TURN_METADATA,
        params![
            turn_id,
            metadata.model,
            metadata.input_tokens,
            metadata.output_tokens,
            metadata.stop_reason,
            metadata.response_metadata,
        ],
    )?;
    Ok(())
}

fn insert_blocks(
    conn: &Connection,
    turn_id: &str,
    start: u32,
    blocks: &[Block],
) -> Result<Vec<TurnBlock>> {
    let now = Utc::now();
    let mut written = Vec::with_capacity(blocks.len());
    for (sequence, block) in (start..).zip(blocks) {
        let id = new_block_id();
        write_block(conn, &id, turn_id, (sequence, None), block, now)?;
        written.push(TurnBlock {
            id,
            turn_id: turn_id.to_string(),
            sequence,
            block: block.clone(),
            created_at: now,
            event_id: None,
        });
    }
    Ok(written)
}

fn upsert_blocks(conn: &Connection, turn_id: &str, blocks: &[StagedBlock]) -> Result<()> {
    let mut next: u32 = conn.query_row(SQL_NEXT_SEQUENCE, [turn_id], |row| row.get(0))?;
    let mut ordered: Vec<&StagedBlock> = blocks.iter().collect();
    ordered.sort_by_key(|staged| staged.sequence);

    let now = Utc::now();
    for staged in ordered {
        let sequence = staged.sequence;
        if sequence > next {
            return Err(Error::Validation(format!(
                "block sequence {sequence} leaves a gap in turn {turn_id} (next is {next})"
            )));
        }
        write_block(
            conn,
            &new_block_id(),
            turn_id,
            (sequence, staged.event_id),
            &staged.block,
            now,
        )?;
        next = next.max(sequence + 1);
    }
    Ok(())
}

fn write_block(
    conn: &Connection,
    id: &str,
    turn_id: &str,
    (sequence, event_id): (u32, Option<u64>),
    block: &Block,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let (text_content, content) = split_payload(&block.payload)?;
    conn.execute(
        SQL_UPSERT_BLOCK,
        params![
            id,
            turn_id,
            sequence,
            block.block_type().as_str(),
            text_content,
            content,
            block.provider,
            block.provider_data,
            event_id,
            now
        ],
    )?;
    Ok(())
}

fn select_blocks(conn: &Connection, turn_id: &str) -> Result<Vec<TurnBlock>> {
    let mut stmt = conn.prepare(SQL_SELECT_BLOCKS)?;
    let rows = stmt
        .query_map([turn_id], BlockRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(BlockRow::into_turn_block).collect()
}

#[cfg(test)]
mod tests {
    use llm_core::BlockType;
    use serde_json::json;

    use super::*;

    fn exchange(store: &ConversationStore, target: ChatTarget, prev: Option<&str>) -> Exchange {
        store
            .create_exchange(&NewExchange {
                target,
                prev_turn_id: prev.map(str::to_string),
                user_blocks: vec![Block::text("Tighten the opening paragraph")],
                model: "lorem/lorem-fast".to_string(),
            })
            .unwrap()
    }

    fn cold_start(store: &ConversationStore) -> Exchange {
        exchange(
            store,
            ChatTarget::New {
                project_id: "proj_1".to_string(),
                system_prompt: None,
            },
            None,
        )
    }

    #[test]
    fn cold_start_creates_chat_and_both_turns() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);

        assert_eq!(ex.chat.title, "Tighten the opening paragraph");
        assert_eq!(ex.user_turn.status, TurnStatus::Complete);
        assert_eq!(ex.assistant_turn.status, TurnStatus::Pending);
        assert_eq!(
            ex.assistant_turn.prev_turn_id.as_deref(),
            Some(ex.user_turn.id.as_str())
        );
        let chat = store.get_chat(&ex.chat.id).unwrap();
        assert_eq!(
            chat.last_viewed_turn_id.as_deref(),
            Some(ex.assistant_turn.id.as_str())
        );
        assert_eq!(store.turn_blocks(&ex.user_turn.id).unwrap().len(), 1);
    }

    #[test]
    fn failed_exchange_writes_nothing() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);

        let err = store
            .create_exchange(&NewExchange {
                target: ChatTarget::Existing(ex.chat.id.clone()),
                prev_turn_id: Some("turn_missing".to_string()),
                user_blocks: vec![Block::text("hello")],
                model: "lorem/lorem".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.root_turns(&ex.chat.id).unwrap().len(), 1);
    }

    #[test]
    fn create_turn_rejects_unknown_parent() {
        let store = ConversationStore::in_memory().unwrap();
        let chat = store.create_chat("proj_1", "Draft", None).unwrap();
        let err = store
            .create_turn(&NewTurn {
                chat_id: chat.id,
                role: Role::User,
                status: TurnStatus::Complete,
                prev_turn_id: Some("turn_nope".to_string()),
                model: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn siblings_share_parent_and_paths_diverge() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let second = store
            .create_turn(&NewTurn {
                chat_id: ex.chat.id.clone(),
                role: Role::Assistant,
                status: TurnStatus::Pending,
                prev_turn_id: Some(ex.user_turn.id.clone()),
                model: None,
            })
            .unwrap();

        let siblings = store.sibling_ids(&second.id).unwrap();
        assert_eq!(siblings, vec![ex.assistant_turn.id.clone(), second.id.clone()]);
        assert_eq!(store.sibling_ids(&ex.assistant_turn.id).unwrap(), siblings);

        let path: Vec<String> = store
            .turn_path(&second.id)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(path, vec![ex.user_turn.id.clone(), second.id.clone()]);
        assert!(!path.contains(&ex.assistant_turn.id));
    }

    #[test]
    fn root_siblings_are_scoped_to_chat() {
        let store = ConversationStore::in_memory().unwrap();
        let a = cold_start(&store);
        let b = cold_start(&store);
        assert_eq!(
            store.sibling_ids(&a.user_turn.id).unwrap(),
            vec![a.user_turn.id.clone()]
        );
        assert_ne!(a.chat.id, b.chat.id);
    }

    #[test]
    fn blocks_keep_sequence_and_provider_data() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let thinking = Block::new(llm_core::BlockPayload::Thinking {
            text: "plan".to_string(),
        })
        .with_provider("anthropic", Some(json!({"signature": "abc"})));

        store
            .append_blocks(
                &ex.assistant_turn.id,
                &[
                    thinking.clone(),
                    Block::tool_use("t1", "doc_view", json!({"path": "a.md"})),
                ],
            )
            .unwrap();

        let blocks = store.turn_blocks(&ex.assistant_turn.id).unwrap();
        let sequences: Vec<u32> = blocks.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(blocks[0].block, thinking);
        assert_eq!(blocks[1].block.block_type(), BlockType::ToolUse);
    }

    #[test]
    fn write_blocks_is_idempotent_and_rejects_gaps() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let turn = &ex.assistant_turn.id;

        let blocks = vec![
            StagedBlock::new(0, Block::text("one")).with_event_id(4),
            StagedBlock::new(1, Block::text("two")).with_event_id(7),
        ];
        store.write_blocks(turn, &blocks).unwrap();
        store.write_blocks(turn, &blocks).unwrap();
        let stored = store.turn_blocks(turn).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].event_id, Some(7));

        let err = store
            .write_blocks(turn, &[StagedBlock::new(5, Block::text("far"))])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn partial_text_upserts_in_place() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let turn = &ex.assistant_turn.id;

        store.upsert_partial_text(turn, 0, "Lorem").unwrap();
        store.upsert_partial_text(turn, 0, "Lorem ipsum").unwrap();

        let blocks = store.turn_blocks(turn).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block.text_content(), Some("Lorem ipsum"));
    }

    #[test]
    fn finalize_writes_status_and_usage() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let turn = &ex.assistant_turn.id;

        store
            .finalize_turn(
                turn,
                &Finalize {
                    status: TurnStatus::Cancelled,
                    blocks: vec![
                        StagedBlock::new(1, Block::text("half a sen")).with_event_id(9),
                        StagedBlock::new(0, Block::text("done block")).with_event_id(5),
                    ],
                    metadata: TurnMetadata {
                        input_tokens: Some(12),
                        output_tokens: Some(5),
                        ..TurnMetadata::default()
                    },
                    error: None,
                    terminal_event_id: Some(10),
                },
            )
            .unwrap();

        let saved = store.get_turn(turn).unwrap();
        assert_eq!(saved.status, TurnStatus::Cancelled);
        assert_eq!(saved.output_tokens, Some(5));
        assert_eq!(saved.last_event_id, Some(10));
        assert!(saved.completed_at.is_some());
        let blocks = store.turn_blocks(turn).unwrap();
        assert_eq!(blocks[1].block.text_content(), Some("half a sen"));
        assert_eq!(blocks[1].event_id, Some(9));
    }

    #[test]
    fn failed_finalize_leaves_turn_untouched() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        let turn = &ex.assistant_turn.id;
        store.update_turn_status(turn, TurnStatus::Streaming).unwrap();

        let err = store
            .finalize_turn(
                turn,
                &Finalize {
                    status: TurnStatus::Complete,
                    blocks: vec![
                        StagedBlock::new(0, Block::text("kept back")),
                        StagedBlock::new(2, Block::text("after a hole")),
                    ],
                    metadata: TurnMetadata {
                        output_tokens: Some(8),
                        ..TurnMetadata::default()
                    },
                    error: None,
                    terminal_event_id: Some(6),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let saved = store.get_turn(turn).unwrap();
        assert_eq!(saved.status, TurnStatus::Streaming);
        assert_eq!(saved.output_tokens, None);
        assert_eq!(saved.last_event_id, None);
        assert!(store.turn_blocks(turn).unwrap().is_empty());
    }

    #[test]
    fn batch_block_fetch_groups_by_turn() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        store
            .append_blocks(&ex.assistant_turn.id, &[Block::text("reply")])
            .unwrap();

        let ids = vec![
            ex.user_turn.id.clone(),
            ex.assistant_turn.id.clone(),
            "turn_empty".to_string(),
        ];
        let grouped = store.blocks_for_turns(&ids).unwrap();
        assert_eq!(grouped[&ex.user_turn.id].len(), 1);
        assert_eq!(grouped[&ex.assistant_turn.id].len(), 1);
        assert!(grouped["turn_empty"].is_empty());
    }

    #[test]
    fn pagination_follows_newest_child() {
        let store = ConversationStore::in_memory().unwrap();
        let first = cold_start(&store);
        let chat_id = first.chat.id.clone();
        let second = exchange(
            &store,
            ChatTarget::Existing(chat_id.clone()),
            Some(&first.assistant_turn.id),
        );

        let page = store
            .paginated_turns(&chat_id, Some(&first.user_turn.id), PageDirection::After, 10)
            .unwrap();
        let ids: Vec<&str> = page.turns.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                first.assistant_turn.id.as_str(),
                second.user_turn.id.as_str(),
                second.assistant_turn.id.as_str()
            ]
        );
        assert!(!page.has_more_after);

        let page = store
            .paginated_turns(&chat_id, None, PageDirection::Before, 2)
            .unwrap();
        assert_eq!(page.turns.len(), 2);
        assert!(page.has_more_before);
        assert_eq!(page.turns[1].id, second.assistant_turn.id);
    }

    #[test]
    fn stale_turns_fail_on_startup() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        assert_eq!(store.fail_stale_turns("interrupted by server restart").unwrap(), 1);
        let turn = store.get_turn(&ex.assistant_turn.id).unwrap();
        assert_eq!(turn.status, TurnStatus::Error);
        assert_eq!(turn.error.as_deref(), Some("interrupted by server restart"));
    }

    #[test]
    fn deleted_chats_are_hidden() {
        let store = ConversationStore::in_memory().unwrap();
        let ex = cold_start(&store);
        store.delete_chat(&ex.chat.id).unwrap();
        assert!(matches!(store.get_chat(&ex.chat.id), Err(Error::NotFound(_))));
        assert!(store.list_chats("proj_1").unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("meridian.db");
        let chat_id = {
            let store = ConversationStore::open(&path).unwrap();
            cold_start(&store).chat.id
        };
        let store = ConversationStore::open(&path).unwrap();
        assert_eq!(store.get_chat(&chat_id).unwrap().project_id, "proj_1");
    }
}

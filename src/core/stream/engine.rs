//! Streaming engine: drives one generation per assistant turn.
//!
//! A turn moves `pending -> streaming -> complete | cancelled | error`.
//! Each turn runs on its own task that pulls events from the provider,
//! publishes them through the turn's [`StreamWriter`], commits completed
//! blocks as they close and executes tool calls between provider rounds.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use llm_core::{
    Block, BlockPayload, BlockType, CompletionEvent, CompletionRequest, Delta, ErrorKind,
    LlmProvider, Message, ProviderError, RequestParams, Role, StopReason, StreamDelta, Usage,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::buffer::{EventStream, StreamRegistry, StreamWriter};
use super::events::{SequencedEvent, TurnEvent};
use crate::config::StreamingConfig;
use crate::core::chat::{Chat, NewTurn, Turn, TurnBlock, TurnMetadata, TurnStatus, history};
use crate::core::error::{Error, Result};
use crate::core::registry::{ModelRef, ProviderRegistry};
use crate::core::store::{
    ChatTarget, ConversationStore, Exchange, Finalize, NewExchange, PageDirection, StagedBlock,
    TurnPage,
};
use crate::core::tools::{ToolCall, ToolRegistry};

const TOOL_LIMIT_MESSAGE: &str = "tool round limit reached";
const INTERRUPTED_MESSAGE: &str = "turn was interrupted";

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// `provider/model` or a bare model name. Defaults to the configured model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking: bool,
    pub thinking_budget: Option<u32>,
    /// Offer the registered tools to the model.
    pub tools: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: None,
            temperature: None,
            thinking: false,
            thinking_budget: None,
            tools: true,
        }
    }
}

/// A user message and the generation it should trigger.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub prev_turn_id: Option<String>,
    pub blocks: Vec<Block>,
    pub options: GenerationOptions,
}

/// Orchestrates turn creation, generation and event delivery.
pub struct StreamingEngine {
    store: Arc<ConversationStore>,
    providers: Arc<ProviderRegistry>,
    streams: Arc<StreamRegistry>,
    tools: Arc<ToolRegistry>,
    settings: StreamingConfig,
    default_model: String,
}

impl StreamingEngine {
    #[must_use]
    pub fn new(
        store: Arc<ConversationStore>,
        providers: Arc<ProviderRegistry>,
        tools: ToolRegistry,
        settings: StreamingConfig,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            providers,
            streams: Arc::new(StreamRegistry::new(settings.retention())),
            tools: Arc::new(tools),
            settings,
            default_model: default_model.into(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    #[must_use]
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Mark turns orphaned by a previous process as failed.
    pub fn recover(&self) -> Result<usize> {
        let failed = self.store.fail_stale_turns("interrupted by server restart")?;
        if failed > 0 {
            tracing::warn!(count = failed, "failed turns left over from a previous run");
        }
        Ok(failed)
    }

    /// Release cached providers.
    pub fn shutdown(&self) {
        tracing::info!(active = self.streams.active_count(), "streaming engine shutting down");
        self.providers.shutdown();
    }

    /// Add a user turn to an existing chat and start generating the reply.
    ///
    /// Must be called within a Tokio runtime.
    pub fn create_turn(&self, chat_id: &str, request: TurnRequest) -> Result<Exchange> {
        self.begin(ChatTarget::Existing(chat_id.to_string()), request)
    }

    /// Create a chat with its first user turn and start generating the reply.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_chat(
        &self,
        project_id: &str,
        system_prompt: Option<String>,
        request: TurnRequest,
    ) -> Result<Exchange> {
        if project_id.trim().is_empty() {
            return Err(Error::Validation("project id is empty".to_string()));
        }
        self.begin(
            ChatTarget::New {
                project_id: project_id.to_string(),
                system_prompt,
            },
            request,
        )
    }

    fn begin(&self, target: ChatTarget, request: TurnRequest) -> Result<Exchange> {
        validate_user_blocks(&request.blocks)?;
        let reference = request.options.model.as_deref().unwrap_or(&self.default_model);
        let (model, provider) = self.resolve(reference)?;

        let exchange = self.store.create_exchange(&NewExchange {
            target,
            prev_turn_id: request.prev_turn_id,
            user_blocks: request.blocks,
            model: model.to_string(),
        })?;
        self.launch(
            &exchange.chat,
            &exchange.assistant_turn,
            model,
            provider,
            &request.options,
        )?;
        Ok(exchange)
    }

    /// Generate a new assistant reply next to `turn_id`.
    ///
    /// An assistant turn gets a sibling under the same user turn; a user
    /// turn gets a new child. The previous model is reused unless
    /// `options` names one.
    pub fn regenerate(&self, turn_id: &str, options: &GenerationOptions) -> Result<Turn> {
        let turn = self.store.get_turn(turn_id)?;
        let (parent_id, previous_model) = match turn.role {
            Role::User => (turn.id.clone(), None),
            Role::Assistant => (
                turn.prev_turn_id.clone().ok_or_else(|| {
                    Error::Validation(format!("turn {turn_id} has no user turn to answer"))
                })?,
                turn.model.clone(),
            ),
        };
        let reference = options
            .model
            .clone()
            .or(previous_model)
            .unwrap_or_else(|| self.default_model.clone());
        let (model, provider) = self.resolve(&reference)?;
        let chat = self.store.get_chat(&turn.chat_id)?;

        let assistant = self.store.create_turn(&NewTurn {
            chat_id: chat.id.clone(),
            role: Role::Assistant,
            status: TurnStatus::Pending,
            prev_turn_id: Some(parent_id),
            model: Some(model.to_string()),
        })?;
        self.store.set_last_viewed_turn(&chat.id, &assistant.id)?;
        self.launch(&chat, &assistant, model, provider, options)?;
        Ok(assistant)
    }

    /// Ask the turn's task to stop.
    pub fn interrupt(&self, turn_id: &str) -> Result<()> {
        self.streams.cancel(turn_id)
    }

    /// Event feed for a turn, resuming after the event id in `marker`.
    ///
    /// Live and recently finished turns are served from their stream.
    /// Anything else is replayed from the store as catchup followed by a
    /// terminal event matching the turn's status.
    pub fn subscribe(&self, turn_id: &str, marker: Option<&str>) -> Result<EventStream> {
        let last_seen = parse_marker(marker)?;

        if let Some(stream) = self.streams.get(turn_id) {
            return stream.subscribe(last_seen, || self.store.turn_blocks(turn_id));
        }

        let turn = self.store.get_turn(turn_id)?;
        let blocks = self.store.turn_blocks(turn_id)?;
        Ok(Box::pin(futures::stream::iter(stored_feed(
            &turn, blocks, last_seen,
        ))))
    }

    // Read-through queries

    pub fn chat(&self, chat_id: &str) -> Result<Chat> {
        self.store.get_chat(chat_id)
    }

    pub fn chats(&self, project_id: &str) -> Result<Vec<Chat>> {
        self.store.list_chats(project_id)
    }

    pub fn delete_chat(&self, chat_id: &str) -> Result<()> {
        self.store.delete_chat(chat_id)
    }

    pub fn history(
        &self,
        chat_id: &str,
        from_turn_id: Option<&str>,
        direction: PageDirection,
        limit: usize,
    ) -> Result<TurnPage> {
        self.store
            .paginated_turns(chat_id, from_turn_id, direction, limit)
    }

    pub fn path(&self, turn_id: &str) -> Result<Vec<Turn>> {
        self.store.turn_path(turn_id)
    }

    pub fn siblings(&self, turn_id: &str) -> Result<Vec<String>> {
        self.store.sibling_ids(turn_id)
    }

    /// Sibling ids for each of `turn_ids`, for branch navigation.
    pub fn sibling_map(&self, turn_ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        self.store.siblings_for_turns(turn_ids)
    }

    pub fn blocks(&self, turn_id: &str) -> Result<Vec<TurnBlock>> {
        self.store.get_turn(turn_id)?;
        self.store.turn_blocks(turn_id)
    }

    fn resolve(&self, reference: &str) -> Result<(ModelRef, Arc<dyn LlmProvider>)> {
        let model = ModelRef::parse(reference)?;
        let provider = self.providers.get(&model.provider)?;
        Ok((model, provider))
    }

    fn launch(
        &self,
        chat: &Chat,
        turn: &Turn,
        model: ModelRef,
        provider: Arc<dyn LlmProvider>,
        options: &GenerationOptions,
    ) -> Result<()> {
        let writer = self.streams.claim(&turn.id)?;
        let params = RequestParams {
            max_tokens: options
                .max_tokens
                .unwrap_or(self.settings.default_max_tokens),
            temperature: options.temperature,
            system: chat.system_prompt.clone(),
            tools: if options.tools {
                self.tools.definitions()
            } else {
                Vec::new()
            },
            thinking: options.thinking,
            thinking_budget: options.thinking_budget,
        };

        let run = TurnRun {
            turn_id: turn.id.clone(),
            store: Arc::clone(&self.store),
            tools: Arc::clone(&self.tools),
            settings: self.settings.clone(),
            provider,
            model,
            params,
            writer,
            progress: Progress::default(),
        };
        tokio::spawn(run.drive());
        Ok(())
    }
}

impl std::fmt::Debug for StreamingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingEngine")
            .field("default_model", &self.default_model)
            .field("active_streams", &self.streams.active_count())
            .finish_non_exhaustive()
    }
}

fn parse_marker(marker: Option<&str>) -> Result<Option<u64>> {
    marker
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| {
            m.parse::<u64>()
                .map_err(|_| Error::InvalidMarker(m.to_string()))
        })
        .transpose()
}

fn validate_user_blocks(blocks: &[Block]) -> Result<()> {
    let mut has_content = false;
    for block in blocks {
        match &block.payload {
            BlockPayload::Text { text } => has_content |= !text.trim().is_empty(),
            BlockPayload::Image { .. }
            | BlockPayload::Reference { .. }
            | BlockPayload::PartialReference { .. } => has_content = true,
            other => {
                return Err(Error::Validation(format!(
                    "{} blocks cannot be sent by the user",
                    other.block_type()
                )));
            }
        }
    }
    if has_content {
        Ok(())
    } else {
        Err(Error::Validation("message has no content".to_string()))
    }
}

/// Feed for a turn with no stream: stored blocks, then its terminal state.
///
/// Streamed blocks keep the id of the `block_stop` that published them and
/// the terminal keeps its live id, so a marker taken from the live feed
/// resumes at the same point. Blocks written outside a stream use
/// `sequence + 1`.
fn stored_feed(turn: &Turn, blocks: Vec<TurnBlock>, last_seen: Option<u64>) -> Vec<SequencedEvent> {
    let after = last_seen.unwrap_or(0);
    let last_block_index = blocks.last().map(|b| b.sequence);

    let mut last_id = 0;
    let mut events = Vec::with_capacity(blocks.len() + 1);
    for block in blocks {
        let id = block
            .event_id
            .unwrap_or_else(|| u64::from(block.sequence) + 1);
        last_id = last_id.max(id);
        if id > after {
            events.push(SequencedEvent {
                id,
                event: TurnEvent::BlockCatchup { block },
            });
        }
    }
    events.sort_by_key(|e| e.id);

    let terminal = match turn.status {
        TurnStatus::Complete => TurnEvent::TurnComplete {
            turn_id: turn.id.clone(),
            stop_reason: turn
                .stop_reason
                .clone()
                .unwrap_or_else(|| StopReason::EndTurn.as_str().to_string()),
            input_tokens: turn.input_tokens.unwrap_or(0),
            output_tokens: turn.output_tokens.unwrap_or(0),
            response_metadata: turn.response_metadata.clone(),
        },
        TurnStatus::Cancelled => TurnEvent::TurnError {
            turn_id: turn.id.clone(),
            error: INTERRUPTED_MESSAGE.to_string(),
            error_kind: None,
            retryable: false,
            is_cancelled: true,
            last_block_index,
        },
        TurnStatus::Error => TurnEvent::TurnError {
            turn_id: turn.id.clone(),
            error: turn.error.clone().unwrap_or_else(|| "generation failed".to_string()),
            error_kind: None,
            retryable: true,
            is_cancelled: false,
            last_block_index,
        },
        TurnStatus::Pending | TurnStatus::Streaming => TurnEvent::TurnError {
            turn_id: turn.id.clone(),
            error: "turn is no longer streaming".to_string(),
            error_kind: None,
            retryable: true,
            is_cancelled: false,
            last_block_index,
        },
    };
    // With no recorded terminal id, place it past anything the client saw.
    let terminal_id = turn
        .last_event_id
        .unwrap_or_else(|| last_id.max(after) + 1);
    if terminal_id > after {
        events.push(SequencedEvent {
            id: terminal_id,
            event: terminal,
        });
    }
    events
}

/// Block still receiving deltas.
#[derive(Debug)]
struct OpenBlock {
    block_type: BlockType,
    text: String,
    json: String,
}

impl OpenBlock {
    fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            text: String::new(),
            json: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    /// Turn-level sequence of the next block.
    next_sequence: u32,
    /// Blocks still receiving deltas, by sequence.
    open: BTreeMap<u32, OpenBlock>,
    /// Highest sequence closed with a full block.
    last_closed: Option<u32>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    response_metadata: Option<Value>,
}

impl Progress {
    fn allocate(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

enum Round {
    Finished {
        stop_reason: StopReason,
        calls: Vec<ToolCall>,
    },
    Failed(ProviderError),
    Cancelled,
}

enum Outcome {
    Complete(StopReason),
    Failed {
        error: String,
        kind: Option<ErrorKind>,
        retryable: bool,
    },
    Cancelled,
}

impl Outcome {
    fn provider(err: &ProviderError) -> Self {
        Self::Failed {
            error: err.to_string(),
            kind: Some(err.kind()),
            retryable: err.is_retryable(),
        }
    }

    fn internal(err: &Error) -> Self {
        Self::Failed {
            error: err.to_string(),
            kind: None,
            retryable: true,
        }
    }
}

/// Resolves once the turn is interrupted.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    // A closed channel can never signal.
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Blocks closed by the `block_stop` events in `events`, tagged with the
/// id of their stop event.
fn stopped_blocks(events: Vec<SequencedEvent>) -> Vec<StagedBlock> {
    events
        .into_iter()
        .filter_map(|e| match e.event {
            TurnEvent::BlockStop {
                block_index,
                block: Some(block),
            } => Some(StagedBlock::new(block_index, block).with_event_id(e.id)),
            _ => None,
        })
        .collect()
}

/// State of one running generation. Owned by the turn's task.
struct TurnRun {
    turn_id: String,
    store: Arc<ConversationStore>,
    tools: Arc<ToolRegistry>,
    settings: StreamingConfig,
    provider: Arc<dyn LlmProvider>,
    model: ModelRef,
    params: RequestParams,
    writer: StreamWriter,
    progress: Progress,
}

impl TurnRun {
    async fn drive(mut self) {
        tracing::info!(turn_id = %self.turn_id, model = %self.model, "turn started");

        let turn_id = self.turn_id.clone();
        let marked = self
            .on_store(move |store| store.update_turn_status(&turn_id, TurnStatus::Streaming))
            .await;
        if let Err(e) = marked {
            tracing::warn!(turn_id = %self.turn_id, error = %e, "failed to mark turn streaming");
        }
        self.writer.emit(TurnEvent::TurnStart {
            turn_id: self.turn_id.clone(),
            model: self.model.to_string(),
        });

        let mut cancel = self.writer.cancelled();
        let outcome = self.generate(&mut cancel).await;
        self.conclude(outcome).await;
    }

    /// Run a store call on the blocking pool.
    async fn on_store<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&ConversationStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(&store)).await?
    }

    async fn generate(&mut self, cancel: &mut watch::Receiver<bool>) -> Outcome {
        let mut tool_rounds = 0;

        loop {
            let messages = match self.history().await {
                Ok(messages) => messages,
                Err(e) => return Outcome::internal(&e),
            };

            let (stop_reason, calls) = match self.stream_round(messages, cancel).await {
                Round::Finished { stop_reason, calls } => (stop_reason, calls),
                Round::Failed(err) => {
                    tracing::warn!(turn_id = %self.turn_id, error = %err, "provider call failed");
                    return Outcome::provider(&err);
                }
                Round::Cancelled => return Outcome::Cancelled,
            };
            if calls.is_empty() {
                return Outcome::Complete(stop_reason);
            }

            if tool_rounds >= self.settings.max_tool_rounds {
                tracing::warn!(
                    turn_id = %self.turn_id,
                    rounds = tool_rounds,
                    "tool round limit reached"
                );
                let results = calls
                    .iter()
                    .map(|call| call.error_result(TOOL_LIMIT_MESSAGE))
                    .collect();
                self.emit_tool_results(results);
                return Outcome::Failed {
                    error: TOOL_LIMIT_MESSAGE.to_string(),
                    kind: None,
                    retryable: false,
                };
            }
            tool_rounds += 1;

            tracing::debug!(turn_id = %self.turn_id, count = calls.len(), round = tool_rounds, "running tools");
            let timeout = self.settings.tool_timeout();
            let results = tokio::select! {
                biased;
                () = cancelled(cancel) => return Outcome::Cancelled,
                results = self.tools.execute_calls(&calls, timeout) => results,
            };
            self.emit_tool_results(results);

            // The next round reads its history from the store.
            if let Err(e) = self.commit_with_retries(|events| self.commit(events)).await {
                return Outcome::internal(&e);
            }
        }
    }

    /// Conversation so far, including this turn's committed blocks.
    async fn history(&self) -> Result<Vec<Message>> {
        let turn_id = self.turn_id.clone();
        self.on_store(move |store| {
            let mut path = store.turn_path(&turn_id)?;
            if let Some(current) = path.last_mut() {
                current.status = TurnStatus::Complete;
            }
            let ids: Vec<String> = path.iter().map(|t| t.id.clone()).collect();
            let blocks = store.blocks_for_turns(&ids)?;
            Ok(history::build_messages(&path, &blocks))
        })
        .await
    }

    /// One provider call, forwarded event by event.
    ///
    /// Provider block indices are local to the call and may skip numbers;
    /// each started block gets the next turn sequence instead.
    async fn stream_round(
        &mut self,
        messages: Vec<Message>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Round {
        let request = CompletionRequest {
            model: self.model.model.clone(),
            messages,
            params: self.params.clone(),
        };
        let deadline = Instant::now() + self.settings.provider_timeout();
        let mut slots: HashMap<u32, u32> = HashMap::new();
        let mut calls = Vec::new();
        let mut stop_reason = None;

        let opened = tokio::select! {
            biased;
            () = cancelled(cancel) => return Round::Cancelled,
            opened = tokio::time::timeout_at(deadline, self.provider.stream(request)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Round::Failed(err),
            Err(_) => return Round::Failed(ProviderError::Timeout),
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancelled(cancel) => return Round::Cancelled,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let event = match next {
                Err(_) => return Round::Failed(ProviderError::Timeout),
                Ok(None) => break,
                Ok(Some(Err(err))) => return Round::Failed(err),
                Ok(Some(Ok(event))) => event,
            };

            match event {
                CompletionEvent::BlockStart { index, block_type } => {
                    let sequence = self.open_block(block_type);
                    slots.insert(index, sequence);
                }
                CompletionEvent::Delta(delta) => match slots.get(&delta.block_index) {
                    Some(&sequence) => self.forward_delta(sequence, delta.delta),
                    None => tracing::debug!(
                        turn_id = %self.turn_id,
                        index = delta.block_index,
                        "dropping delta for a block that never started"
                    ),
                },
                CompletionEvent::BlockStop { index, block } => {
                    let sequence = match slots.get(&index) {
                        Some(&sequence) => sequence,
                        None => {
                            let sequence = self.open_block(block.block_type());
                            slots.insert(index, sequence);
                            sequence
                        }
                    };
                    if let Some(call) = ToolCall::from_block(&block) {
                        calls.push(call);
                    }
                    self.close_block(sequence, block);
                    // Committed blocks must form a prefix of the turn.
                    if self.progress.open.is_empty() {
                        self.checkpoint().await;
                    }
                }
                CompletionEvent::Done {
                    stop_reason: reason,
                    usage,
                    metadata,
                    ..
                } => {
                    self.progress.usage.add(usage);
                    self.progress.stop_reason = Some(reason);
                    if metadata.is_some() {
                        self.progress.response_metadata = metadata;
                    }
                    stop_reason = Some(reason);
                }
            }
        }

        match stop_reason {
            Some(_) if !self.progress.open.is_empty() => Round::Failed(ProviderError::Network(
                "provider stream finished with a block still open".to_string(),
            )),
            Some(stop_reason) => Round::Finished { stop_reason, calls },
            None => Round::Failed(ProviderError::Network(
                "provider stream ended before completion".to_string(),
            )),
        }
    }

    /// Allocate the next sequence and announce the block.
    fn open_block(&mut self, block_type: BlockType) -> u32 {
        let sequence = self.progress.allocate();
        self.progress
            .open
            .insert(sequence, OpenBlock::new(block_type));
        self.writer.emit(TurnEvent::BlockStart {
            block_index: sequence,
            block_type,
        });
        sequence
    }

    fn forward_delta(&mut self, sequence: u32, delta: Delta) {
        if let Some(open) = self.progress.open.get_mut(&sequence) {
            match &delta {
                // Tool input is sent whole when its block closes.
                Delta::JsonDelta { json } => {
                    open.json.push_str(json);
                    return;
                }
                Delta::TextDelta { text } | Delta::ThinkingDelta { text } => {
                    open.text.push_str(text);
                }
                _ => {}
            }
        }
        self.writer
            .emit(TurnEvent::BlockDelta(StreamDelta::new(sequence, delta)));
    }

    fn close_block(&mut self, sequence: u32, block: Block) {
        let open = self.progress.open.remove(&sequence);
        if let Some(json) = open.map(|o| o.json).filter(|j| !j.is_empty()) {
            self.writer.emit(TurnEvent::BlockDelta(StreamDelta::new(
                sequence,
                Delta::JsonDelta { json },
            )));
        }
        self.writer.emit(TurnEvent::BlockStop {
            block_index: sequence,
            block: Some(block),
        });
        self.progress.last_closed = self.progress.last_closed.max(Some(sequence));
    }

    fn emit_tool_results(&mut self, results: Vec<Block>) {
        for block in results {
            let sequence = self.open_block(BlockType::ToolResult);
            let json = serde_json::to_string(&block.payload).unwrap_or_else(|_| "{}".to_string());
            self.forward_delta(sequence, Delta::JsonDelta { json });
            self.close_block(sequence, block);
        }
    }

    /// Write the blocks closed in `events`.
    async fn commit(&self, events: Vec<SequencedEvent>) -> Result<()> {
        let blocks = stopped_blocks(events);
        if blocks.is_empty() {
            return Ok(());
        }
        let turn_id = self.turn_id.clone();
        self.on_store(move |store| store.write_blocks(&turn_id, &blocks))
            .await
    }

    /// Commit closed blocks. A failure keeps them buffered for the next commit.
    async fn checkpoint(&self) {
        let committed = self
            .writer
            .persist_and_clear(|events| self.commit(events))
            .await;
        if let Err(e) = committed {
            tracing::warn!(turn_id = %self.turn_id, error = %e, "block commit failed, will retry");
        }
    }

    /// Persist-and-clear with `commit`, retrying with backoff.
    async fn commit_with_retries<F, Fut>(&self, commit: F) -> Result<()>
    where
        F: Fn(Vec<SequencedEvent>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.settings.persist_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.writer.persist_and_clear(&commit).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(turn_id = %self.turn_id, attempt, error = %e, "commit failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Persist the terminal state, then publish the terminal event.
    async fn conclude(mut self, outcome: Outcome) {
        let mut partials = Vec::new();
        for (sequence, open) in std::mem::take(&mut self.progress.open) {
            if open.block_type != BlockType::Text || open.text.is_empty() {
                continue;
            }
            // No block payload: the text is written as a partial block.
            let event_id = self.writer.emit(TurnEvent::BlockStop {
                block_index: sequence,
                block: None,
            });
            partials.push(StagedBlock::new(sequence, Block::text(open.text)).with_event_id(event_id));
        }
        let last_block_index = partials
            .last()
            .map(|p| p.sequence)
            .max(self.progress.last_closed);

        let usage = self.progress.usage;
        let metadata = TurnMetadata {
            model: Some(self.model.to_string()),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            stop_reason: self.progress.stop_reason.map(|s| s.as_str().to_string()),
            response_metadata: self.progress.response_metadata.clone(),
        };

        let turn_id = self.turn_id.clone();
        let (mut status, error, mut terminal) = match outcome {
            Outcome::Complete(stop_reason) => (
                TurnStatus::Complete,
                None,
                TurnEvent::TurnComplete {
                    turn_id,
                    stop_reason: stop_reason.as_str().to_string(),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    response_metadata: metadata.response_metadata.clone(),
                },
            ),
            Outcome::Failed {
                error,
                kind,
                retryable,
            } => (
                TurnStatus::Error,
                Some(error.clone()),
                TurnEvent::TurnError {
                    turn_id,
                    error,
                    error_kind: kind,
                    retryable,
                    is_cancelled: false,
                    last_block_index,
                },
            ),
            Outcome::Cancelled => (
                TurnStatus::Cancelled,
                None,
                TurnEvent::TurnError {
                    turn_id,
                    error: INTERRUPTED_MESSAGE.to_string(),
                    error_kind: None,
                    retryable: false,
                    is_cancelled: true,
                    last_block_index,
                },
            ),
        };

        // Blocks, metadata and status land in a single transaction.
        let finalize = Finalize {
            status,
            blocks: partials,
            metadata,
            error,
            terminal_event_id: Some(self.writer.next_id()),
        };
        let committed = self
            .commit_with_retries(|events| {
                let mut finalize = finalize.clone();
                finalize.blocks.extend(stopped_blocks(events));
                let turn_id = self.turn_id.clone();
                self.on_store(move |store| store.finalize_turn(&turn_id, &finalize))
            })
            .await;

        if let Err(e) = committed {
            tracing::error!(turn_id = %self.turn_id, error = %e, "failed to persist terminal state");
            let message = format!("failed to persist turn: {e}");
            let turn_id = self.turn_id.clone();
            let recorded = message.clone();
            let marked = self
                .on_store(move |store| store.update_turn_error(&turn_id, &recorded))
                .await;
            if let Err(e) = marked {
                tracing::error!(turn_id = %self.turn_id, error = %e, "failed to mark turn as errored");
            }
            status = TurnStatus::Error;
            terminal = TurnEvent::TurnError {
                turn_id: self.turn_id.clone(),
                error: message,
                error_kind: None,
                retryable: true,
                is_cancelled: false,
                last_block_index,
            };
        }

        tracing::info!(
            turn_id = %self.turn_id,
            status = %status,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "turn finished"
        );
        self.writer.finish(terminal);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn turn(status: TurnStatus) -> Turn {
        Turn {
            id: "turn_1".to_string(),
            chat_id: "chat_1".to_string(),
            role: Role::Assistant,
            status,
            prev_turn_id: None,
            model: None,
            input_tokens: Some(3),
            output_tokens: Some(5),
            stop_reason: Some("max_tokens".to_string()),
            error: Some("boom".to_string()),
            response_metadata: None,
            created_at: Utc::now(),
            completed_at: None,
            last_event_id: None,
        }
    }

    fn stored(sequence: u32) -> TurnBlock {
        TurnBlock {
            id: format!("blk_{sequence}"),
            turn_id: "turn_1".to_string(),
            sequence,
            block: Block::text(format!("part {sequence}")),
            created_at: Utc::now(),
            event_id: None,
        }
    }

    #[test]
    fn markers_must_be_decimal() {
        assert_eq!(parse_marker(None).unwrap(), None);
        assert_eq!(parse_marker(Some(" ")).unwrap(), None);
        assert_eq!(parse_marker(Some("42")).unwrap(), Some(42));
        assert!(matches!(
            parse_marker(Some("abc")),
            Err(Error::InvalidMarker(_))
        ));
        assert!(parse_marker(Some("-1")).is_err());
    }

    #[test]
    fn user_blocks_are_validated() {
        assert!(validate_user_blocks(&[Block::text("hi")]).is_ok());
        assert!(validate_user_blocks(&[]).is_err());
        assert!(validate_user_blocks(&[Block::text("  ")]).is_err());
        let image = Block::new(BlockPayload::Image {
            content: json!({"url": "x"}),
        });
        assert!(validate_user_blocks(&[image]).is_ok());
        let call = Block::tool_use("tu", "doc_view", json!({}));
        assert!(matches!(
            validate_user_blocks(&[Block::text("hi"), call]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn stored_feed_replays_after_marker() {
        let events = stored_feed(
            &turn(TurnStatus::Complete),
            vec![stored(0), stored(1), stored(2)],
            Some(2),
        );
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, [3, 4]);
        assert!(matches!(
            &events[0].event,
            TurnEvent::BlockCatchup { block } if block.sequence == 2
        ));
        assert!(matches!(
            &events[1].event,
            TurnEvent::TurnComplete { stop_reason, output_tokens: 5, .. } if stop_reason == "max_tokens"
        ));
    }

    #[test]
    fn stored_feed_reports_interruption() {
        let events = stored_feed(&turn(TurnStatus::Cancelled), vec![stored(0)], None);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].event,
            TurnEvent::TurnError {
                is_cancelled: true,
                last_block_index: Some(0),
                ..
            }
        ));

        let events = stored_feed(&turn(TurnStatus::Error), Vec::new(), None);
        assert!(matches!(
            &events[0].event,
            TurnEvent::TurnError { error, .. } if error == "boom"
        ));
    }

    #[test]
    fn stored_feed_keeps_streamed_ids() {
        let mut first = stored(0);
        first.event_id = Some(4);
        let mut second = stored(1);
        second.event_id = Some(7);
        let mut done = turn(TurnStatus::Complete);
        done.last_event_id = Some(8);

        let events = stored_feed(&done, vec![first.clone(), second.clone()], Some(4));
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, [7, 8]);

        assert!(stored_feed(&done, vec![first.clone(), second.clone()], Some(8)).is_empty());

        // A turn recovered after a crash has no terminal id on record.
        let events = stored_feed(&turn(TurnStatus::Error), vec![first, second], Some(12));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 13);
        assert!(events[0].event.is_terminal());
    }

    #[test]
    fn stopped_blocks_skip_partial_stops() {
        let events = vec![
            SequencedEvent {
                id: 1,
                event: TurnEvent::BlockStop {
                    block_index: 0,
                    block: Some(Block::text("a")),
                },
            },
            SequencedEvent {
                id: 2,
                event: TurnEvent::BlockStop {
                    block_index: 1,
                    block: None,
                },
            },
        ];
        assert_eq!(
            stopped_blocks(events),
            vec![StagedBlock::new(0, Block::text("a")).with_event_id(1)]
        );
    }
}

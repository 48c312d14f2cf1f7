//! In-memory event buffer for turns that are streaming.
//!
//! Each active turn owns a [`TurnStream`]. Its single [`StreamWriter`]
//! appends events, which are buffered until a commit makes them durable.
//! Subscribers attach at any time with a last-seen event id and receive the
//! content they missed, then live events.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use super::events::{SequencedEvent, TurnEvent};
use crate::core::chat::TurnBlock;
use crate::core::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

/// Feed of events for one subscriber.
pub type EventStream = Pin<Box<dyn Stream<Item = SequencedEvent> + Send>>;

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    start: Option<SequencedEvent>,
    /// Events since the last successful commit.
    buffered: Vec<SequencedEvent>,
    /// Block index to the id of its `block_stop`, for committed blocks.
    committed: BTreeMap<u32, u64>,
    terminal: Option<SequencedEvent>,
    finished_at: Option<Instant>,
}

impl StreamState {
    fn stamp(&mut self, event: TurnEvent) -> SequencedEvent {
        self.next_id += 1;
        SequencedEvent {
            id: self.next_id,
            event,
        }
    }
}

/// Live state of one streaming turn.
#[derive(Debug)]
pub struct TurnStream {
    turn_id: String,
    state: Mutex<StreamState>,
    sender: broadcast::Sender<SequencedEvent>,
    cancel: watch::Sender<bool>,
}

impl TurnStream {
    fn new(turn_id: &str) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (cancel, _) = watch::channel(false);
        Self {
            turn_id: turn_id.to_string(),
            state: Mutex::new(StreamState::default()),
            sender,
            cancel,
        }
    }

    #[must_use]
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Whether the terminal event has been published.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Number of events waiting for a commit.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffered.len()
    }

    /// Ask the writer to stop. Returns `false` once the stream has finished.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }

    /// Attach a subscriber that has seen every event up to `last_seen`.
    ///
    /// Runs under the stream lock, so no event is both replayed and
    /// delivered live. Committed blocks come from `load_blocks` and are
    /// replayed as `block_catchup`; uncommitted events are replayed raw.
    pub fn subscribe<F>(&self, last_seen: Option<u64>, load_blocks: F) -> Result<EventStream>
    where
        F: FnOnce() -> Result<Vec<TurnBlock>>,
    {
        let state = self.state.lock();
        let receiver = self.sender.subscribe();
        let after = last_seen.unwrap_or(0);
        let mut catchup = Vec::new();

        if let Some(start) = state.start.as_ref().filter(|e| e.id > after) {
            catchup.push(start.clone());
        }

        if !state.committed.is_empty() {
            for block in load_blocks()? {
                let Some(&stop_id) = state.committed.get(&block.sequence) else {
                    continue;
                };
                if stop_id > after {
                    catchup.push(SequencedEvent {
                        id: stop_id,
                        event: TurnEvent::BlockCatchup { block },
                    });
                }
            }
        }

        catchup.extend(state.buffered.iter().filter(|e| e.id > after).cloned());
        // Blocks may close out of start order.
        catchup.sort_by_key(|e| e.id);
        let terminal = state.terminal.clone();
        let last_replayed = state.next_id;
        drop(state);

        tracing::debug!(
            turn_id = %self.turn_id,
            after,
            replayed = catchup.len(),
            "subscriber attached"
        );
        Ok(feed(catchup, terminal.filter(|e| e.id > after), receiver, last_replayed))
    }
}

/// Catchup, then the terminal event or live events until it arrives.
fn feed(
    catchup: Vec<SequencedEvent>,
    terminal: Option<SequencedEvent>,
    receiver: broadcast::Receiver<SequencedEvent>,
    last_replayed: u64,
) -> EventStream {
    Box::pin(async_stream::stream! {
        for event in catchup {
            yield event;
        }
        if let Some(terminal) = terminal {
            yield terminal;
            return;
        }

        let mut live = BroadcastStream::new(receiver);
        while let Some(item) = live.next().await {
            // A lagging subscriber ends its feed and reconnects with its last id
            let Ok(event) = item else {
                tracing::warn!("subscriber lagged behind, closing feed");
                return;
            };
            if event.id <= last_replayed {
                continue;
            }
            let done = event.event.is_terminal();
            yield event;
            if done {
                return;
            }
        }
    })
}

/// Unique writer of a [`TurnStream`].
///
/// Obtained from [`StreamRegistry::claim`]. Dropping it without calling
/// [`StreamWriter::finish`] publishes a terminal error so subscribers never
/// hang.
#[derive(Debug)]
pub struct StreamWriter {
    stream: Arc<TurnStream>,
    finished: bool,
}

impl StreamWriter {
    #[must_use]
    pub fn turn_id(&self) -> &str {
        &self.stream.turn_id
    }

    /// Receiver that flips to `true` when the turn is interrupted.
    #[must_use]
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.stream.cancel.subscribe()
    }

    /// Append an event and broadcast it. Returns its id.
    pub fn emit(&self, event: TurnEvent) -> u64 {
        let mut state = self.stream.state.lock();
        let is_start = matches!(event, TurnEvent::TurnStart { .. });
        let sequenced = state.stamp(event);
        let id = sequenced.id;
        if is_start {
            state.start = Some(sequenced.clone());
        } else {
            state.buffered.push(sequenced.clone());
        }
        // No subscribers is fine
        let _ = self.stream.sender.send(sequenced);
        id
    }

    /// Id the next emitted event will carry.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.stream.state.lock().next_id + 1
    }

    /// Hand a snapshot of the buffered events to `commit`; drop them from
    /// the buffer only if it succeeds.
    ///
    /// The stream lock is released while `commit` runs. A subscriber that
    /// attaches meanwhile replays the snapshot raw, and events emitted
    /// meanwhile stay buffered. On failure the buffer is left untouched for
    /// the next attempt.
    pub async fn persist_and_clear<F, Fut>(&self, commit: F) -> Result<()>
    where
        F: FnOnce(Vec<SequencedEvent>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let staged = self.stream.state.lock().buffered.clone();
        let count = staged.len();
        commit(staged).await?;

        let mut state = self.stream.state.lock();
        let count = count.min(state.buffered.len());
        let stops: Vec<(u32, u64)> = state
            .buffered
            .drain(..count)
            .filter_map(|e| match e.event {
                TurnEvent::BlockStop { block_index, .. } => Some((block_index, e.id)),
                _ => None,
            })
            .collect();
        state.committed.extend(stops);
        Ok(())
    }

    /// Publish the terminal event. Consumes the writer.
    pub fn finish(mut self, terminal: TurnEvent) -> u64 {
        self.finished = true;
        publish_terminal(&self.stream, terminal)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::error!(turn_id = %self.stream.turn_id, "stream writer dropped before finishing");
        publish_terminal(
            &self.stream,
            TurnEvent::TurnError {
                turn_id: self.stream.turn_id.clone(),
                error: "stream ended unexpectedly".to_string(),
                error_kind: None,
                retryable: true,
                is_cancelled: false,
                last_block_index: None,
            },
        );
    }
}

fn publish_terminal(stream: &TurnStream, terminal: TurnEvent) -> u64 {
    let mut state = stream.state.lock();
    let sequenced = state.stamp(terminal);
    let id = sequenced.id;
    state.terminal = Some(sequenced.clone());
    state.finished_at = Some(Instant::now());
    let _ = stream.sender.send(sequenced);
    id
}

/// Registry of turn streams, keyed by turn id.
///
/// The map lock is held only to insert, look up or evict; each stream has
/// its own lock for buffer state.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<TurnStream>>>,
    retention: Duration,
}

impl StreamRegistry {
    /// Finished streams stay available for catchup for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Become the writer of `turn_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStreaming`] while another writer is live.
    pub fn claim(&self, turn_id: &str) -> Result<StreamWriter> {
        let mut streams = self.streams.write();
        if streams.get(turn_id).is_some_and(|s| !s.is_finished()) {
            return Err(Error::AlreadyStreaming(turn_id.to_string()));
        }
        let stream = Arc::new(TurnStream::new(turn_id));
        streams.insert(turn_id.to_string(), Arc::clone(&stream));
        Ok(StreamWriter {
            stream,
            finished: false,
        })
    }

    #[must_use]
    pub fn get(&self, turn_id: &str) -> Option<Arc<TurnStream>> {
        self.streams.read().get(turn_id).cloned()
    }

    /// Interrupt a live stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStreaming`] when the turn has no live writer.
    pub fn cancel(&self, turn_id: &str) -> Result<()> {
        match self.get(turn_id) {
            Some(stream) if stream.cancel() => {
                tracing::info!(turn_id = %turn_id, "interrupt requested");
                Ok(())
            }
            _ => Err(Error::NotStreaming(turn_id.to_string())),
        }
    }

    /// Number of streams whose writer is still live.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams
            .read()
            .values()
            .filter(|s| !s.is_finished())
            .count()
    }

    /// Evict finished streams past their retention. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut streams = self.streams.write();
        let before = streams.len();
        streams.retain(|_, stream| {
            stream
                .state
                .lock()
                .finished_at
                .is_none_or(|at| now.duration_since(at) < self.retention)
        });
        let evicted = before - streams.len();
        if evicted > 0 {
            tracing::debug!(evicted, "swept finished streams");
        }
        evicted
    }

    /// Run [`Self::sweep`] every `period` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.sweep();
            }
        })
    }
}

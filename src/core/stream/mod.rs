//! Live turn streaming: wire events, per-turn buffers and the engine.

mod buffer;
mod engine;
mod events;

pub use buffer::{EventStream, StreamRegistry, StreamWriter, TurnStream};
pub use engine::{GenerationOptions, StreamingEngine, TurnRequest};
pub use events::{SequencedEvent, TurnEvent};

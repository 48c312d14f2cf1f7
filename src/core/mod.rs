//! Conversation core shared by the CLI and the HTTP API.

pub mod chat;
mod error;
pub mod registry;
pub mod store;
pub mod stream;
pub mod tools;

pub use error::{Error, Result};

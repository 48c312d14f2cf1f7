//! Meridian - branching conversations with live, resumable generation.
//!
//! This library provides:
//! - A tree-structured conversation store (chats, turns, blocks)
//! - A streaming engine that drives provider adapters and tool calls
//! - An HTTP API with per-turn event feeds that survive reconnects
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐          ┌─────────────┐
//! │     CLI     │          │   HTTP API  │
//! └──────┬──────┘          └──────┬──────┘
//!        └───────────┬────────────┘
//!             ┌──────┴──────┐
//!             │   Engine    │──── llm-core providers
//!             └──────┬──────┘
//!             ┌──────┴──────┐
//!             │    Store    │
//!             └─────────────┘
//! ```

pub mod api;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod core;

pub use config::Config;
pub use core::stream::StreamingEngine;

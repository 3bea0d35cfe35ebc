//! MCP Chat
//!
//! A streaming chat client that lets a model call tools through an XML
//! `<tool>` convention, with tools served in-process or by MCP servers.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP server with a WebSocket chat endpoint
//! - **LLM Orchestration**: streaming gateway plus the tool-call loop
//! - **MCP Client**: tool discovery and execution over stdio and HTTP
//! - **Sessions**: SQLite-backed conversation history
//!
//! # Modules
//!
//! - [`llm`]: gateway driver and orchestrator
//! - [`mcp`]: tool providers and the tool registry
//! - [`protocol`]: tool-call markup and stream frames
//! - [`session`]: conversation and session management

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod protocol;
pub mod server;
pub mod session;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::session::ChatService;

pub use crate::error::ChatError;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Sessions, conversations and the orchestrator behind them.
    pub service: Arc<ChatService>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

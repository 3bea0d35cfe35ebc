//! Sessions: in-memory conversation state and its persistent directory.
//!
//! # Architecture
//!
//! - [`Conversation`]: ordered message log of one session
//! - [`SessionDirectory`]: persistent session list and message logs
//! - [`ChatService`]: active-session pointer, per-session locking, turn
//!   persistence
//!
//! # Example
//!
//! ```rust
//! use mcp_chat::llm::MessageRole;
//! use mcp_chat::session::Conversation;
//!
//! let mut conversation = Conversation::new();
//! conversation.append(MessageRole::User, "Hello!");
//! assert_eq!(conversation.snapshot().len(), 1);
//! ```

mod conversation;
mod directory;
mod service;

pub use conversation::Conversation;
pub use directory::{DEFAULT_SESSION_NAME, SessionDirectory, SessionInfo, SqliteSessionDirectory};
pub use service::ChatService;

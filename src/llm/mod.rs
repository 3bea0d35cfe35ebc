//! Model gateway traits and conversation message types.
//!
//! # Overview
//!
//! The [`LlmDriver`] trait is the streaming interface to a text-generation
//! endpoint: one call per model turn, yielding incremental text fragments.
//! The [`Orchestrator`] builds on top of a driver to run the embedded
//! tool-call loop.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: `OpenAI`-compatible Chat Completions endpoint
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_chat::llm::{ChatCompletionsDriver, LlmSettings};
//!
//! let settings = LlmSettings {
//!     api_url: "https://api.openai.com/v1/chat/completions".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     temperature: 0.7,
//!     max_tokens: 40960,
//! };
//! let driver = ChatCompletionsDriver::new(settings);
//! ```

pub mod chat_completions;
pub mod orchestrator;

pub use chat_completions::ChatCompletionsDriver;
pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnOutcome};

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// LLM connection and sampling settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Full Chat Completions URL (e.g. `https://api.openai.com/v1/chat/completions`).
    pub api_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Fixed sampling temperature sent with every request.
    pub temperature: f32,
    /// Token budget ceiling sent with every request.
    pub max_tokens: u32,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message (also carries tool results fed back to the model).
    User,
    /// Assistant response.
    Assistant,
}

impl MessageRole {
    /// Lowercase wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(ChatError::Config(format!("unknown message role: {other}"))),
        }
    }
}

/// A role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Forward-only sequence of text fragments for one model turn.
///
/// An `Err` item is terminal: drivers yield nothing after it.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Trait for streaming model backends.
///
/// Implementations issue exactly one request per call and never retry;
/// retry policy belongs to the caller.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Stream a completion for the given prompt.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::GatewayTransport`] if the request cannot be
    /// started. Failures after the stream has begun arrive as a final `Err`
    /// item instead.
    async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ChatError>;
}

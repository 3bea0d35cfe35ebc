//! Tool-call orchestrator.
//!
//! Drives one user turn:
//! 1. Append the user message and build the prompt (synthetic system message
//!    advertising the tool catalogue, then the stored history)
//! 2. Stream the model reply to the caller while buffering it
//! 3. Scan the buffered reply for `<tool>` spans and run them left to right
//! 4. Feed the collected `<tool_result>` spans back as the next user message
//!    and repeat until a reply contains no tool call
//!
//! The follow-up rounds run as an explicit loop bounded by
//! [`OrchestratorSettings::max_tool_rounds`]. Once the loop ends, every round
//! whose results were fed back is closed innermost first: its provisional
//! reply (the one holding the `<tool>` tag) is written back in place and the
//! model text produced after it is appended as a closing assistant message.
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_chat::llm::{Orchestrator, OrchestratorSettings};
//! use mcp_chat::protocol::FrameSink;
//! use mcp_chat::session::Conversation;
//!
//! let orchestrator = Orchestrator::new(driver, registry, OrchestratorSettings::default());
//! let (sink, mut frames) = FrameSink::channel(64);
//! let mut conversation = Conversation::new();
//! let outcome = orchestrator.process(&mut conversation, "What time is it?", &sink).await?;
//! ```

use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::error::ChatError;
use crate::mcp::registry::ToolRegistry;
use crate::protocol::{
    FrameSink, StreamFrame, ToolResultEnvelope, diagnostic_note, extract_tool_calls,
    render_system_prompt,
};
use crate::session::Conversation;

use super::{LlmDriver, Message, MessageRole};

/// Fallback base prompt when no provider offers one.
pub const DEFAULT_BASE_PROMPT: &str = "You are a helpful assistant.";

/// Default cap on follow-up rounds per turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Used when the local provider supplies no system prompt.
    pub base_system_prompt: String,
    /// Follow-up model calls allowed after tool execution, per turn.
    pub max_tool_rounds: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            base_system_prompt: DEFAULT_BASE_PROMPT.to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

/// How a turn ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The last reply contained no tool call.
    Completed,
    /// A `<tool>` body was not a valid invocation; later spans were ignored.
    MalformedToolCall,
    /// The model named a tool outside the catalogue.
    UnknownTool,
    /// A tool failed and the model was asked once to explain.
    ToolFailed,
    /// The reply still asked for tools after the last allowed round.
    DepthLimited,
}

/// Tool-call orchestrator over an [`LlmDriver`] and a [`ToolRegistry`].
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    tools: Arc<ToolRegistry>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        tools: Arc<ToolRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            driver,
            tools,
            settings,
        }
    }

    /// Run one user turn against `conversation`, streaming frames to `sink`.
    ///
    /// On success every message of the turn is in `conversation`. On failure
    /// the conversation is rolled back to where it was before the call, and
    /// (unless the caller has gone away) an error frame is sent.
    ///
    /// The completion sentinel is left to the caller, which may still have
    /// work to do (persisting the turn) before the turn is really over.
    pub async fn process(
        &self,
        conversation: &mut Conversation,
        user_message: &str,
        sink: &FrameSink,
    ) -> Result<TurnOutcome, ChatError> {
        let request_id = Uuid::new_v4();
        let turn_start = conversation.len();

        tracing::info!(
            request_id = %request_id,
            history_len = turn_start,
            tool_count = self.tools.catalogue().len(),
            "Starting turn"
        );

        let result = self
            .run_turn(conversation, user_message, sink, request_id)
            .await;

        match &result {
            Ok(outcome) => {
                tracing::info!(request_id = %request_id, ?outcome, "Turn finished");
            }
            Err(ChatError::Cancelled) => {
                tracing::warn!(request_id = %request_id, "Caller disconnected, discarding turn");
                conversation.truncate(turn_start);
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Turn failed, discarding");
                conversation.truncate(turn_start);
                // The receiver may already be gone; nothing left to tell then.
                let _ = sink.emit(StreamFrame::Error(e.to_string())).await;
            }
        }

        result
    }

    async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_message: &str,
        sink: &FrameSink,
        request_id: Uuid,
    ) -> Result<TurnOutcome, ChatError> {
        let mut chain = ToolChain::default();
        let outcome = self
            .run_rounds(conversation, user_message, sink, request_id, &mut chain)
            .await?;

        tracing::debug!(request_id = %request_id, rounds = chain.rounds.len(), "Closing tool rounds");
        chain.close(conversation);
        Ok(outcome)
    }

    async fn run_rounds(
        &self,
        conversation: &mut Conversation,
        user_message: &str,
        sink: &FrameSink,
        request_id: Uuid,
        chain: &mut ToolChain,
    ) -> Result<TurnOutcome, ChatError> {
        let mut pending = user_message.to_string();
        let mut depth = 0usize;

        loop {
            conversation.append(MessageRole::User, std::mem::take(&mut pending));
            let reply = self.complete(conversation, sink).await?;
            chain.record_reply(&reply);
            let provisional = conversation.len().saturating_sub(1);

            let calls = extract_tool_calls(&reply);
            tracing::debug!(
                request_id = %request_id,
                depth,
                reply_len = reply.len(),
                tool_calls = calls.len(),
                "Model reply complete"
            );
            if calls.is_empty() {
                return Ok(TurnOutcome::Completed);
            }

            if depth >= self.settings.max_tool_rounds {
                tracing::warn!(
                    request_id = %request_id,
                    depth,
                    max_tool_rounds = self.settings.max_tool_rounds,
                    "Tool round limit reached"
                );
                sink.text(diagnostic_note(&format!(
                    "Stopped after {} tool rounds; the remaining tool calls were not run.",
                    self.settings.max_tool_rounds
                )))
                .await?;
                return Ok(TurnOutcome::DepthLimited);
            }

            let mut results = String::new();
            for call in calls {
                let call = match call {
                    Ok(call) => call,
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, error = %e, "Malformed tool call");
                        sink.text(diagnostic_note(&e.to_string())).await?;
                        return Ok(TurnOutcome::MalformedToolCall);
                    }
                };

                tracing::info!(request_id = %request_id, tool = %call.name, depth, "Calling tool");

                match self.tools.invoke(&call.name, call.parameters()).await {
                    Ok(output) => {
                        let wrapped = ToolResultEnvelope::success(&call.name, output).render();
                        sink.text(wrapped.clone()).await?;
                        results.push_str(&wrapped);
                    }
                    Err(ChatError::ToolNotFound(name)) => {
                        tracing::warn!(request_id = %request_id, tool = %name, "Unknown tool");
                        sink.text(diagnostic_note(&format!("Unknown tool: {name}")))
                            .await?;
                        return Ok(TurnOutcome::UnknownTool);
                    }
                    Err(e) => {
                        tracing::error!(request_id = %request_id, tool = %call.name, error = %e, "Tool failed");
                        let message = match e {
                            ChatError::ToolExecution { message, .. } => message,
                            other => other.to_string(),
                        };
                        let wrapped = ToolResultEnvelope::failure(&call.name, message).render();
                        sink.text(wrapped.clone()).await?;
                        results.push_str(&wrapped);

                        // One explanation round, never followed by more tools.
                        conversation.append(MessageRole::User, results);
                        let explanation = self.complete(conversation, sink).await?;
                        chain.record_reply(&explanation);
                        return Ok(TurnOutcome::ToolFailed);
                    }
                }
            }

            depth += 1;
            chain.feed(provisional, reply);
            pending = results;
        }
    }

    /// One model call: stream the reply to `sink`, then commit it as an
    /// assistant message.
    async fn complete(
        &self,
        conversation: &mut Conversation,
        sink: &FrameSink,
    ) -> Result<String, ChatError> {
        let prompt = self.build_prompt(conversation);
        let mut fragments = self.driver.stream(prompt).await?;

        let mut buffer = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            sink.text(fragment.as_str()).await?;
            buffer.push_str(&fragment);
        }

        conversation.append(MessageRole::Assistant, buffer.as_str());
        Ok(buffer)
    }

    /// Synthetic system message plus the stored history without any stored
    /// system messages.
    fn build_prompt(&self, conversation: &Conversation) -> Vec<Message> {
        let base = self
            .tools
            .system_prompt()
            .unwrap_or(self.settings.base_system_prompt.as_str());

        std::iter::once(Message::system(render_system_prompt(
            base,
            self.tools.catalogue(),
        )))
        .chain(
            conversation
                .messages()
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .cloned(),
        )
        .collect()
    }
}

/// Tool rounds of one turn whose results went back to the model.
#[derive(Debug, Default)]
struct ToolChain {
    rounds: Vec<FedRound>,
    /// Every model reply of the turn, concatenated in order.
    model_text: String,
}

#[derive(Debug)]
struct FedRound {
    /// Index of the provisional assistant message.
    provisional: usize,
    reply: String,
    /// Offset into `model_text` where the follow-up began.
    follow_up_from: usize,
}

impl ToolChain {
    fn record_reply(&mut self, reply: &str) {
        self.model_text.push_str(reply);
    }

    fn feed(&mut self, provisional: usize, reply: String) {
        self.rounds.push(FedRound {
            provisional,
            reply,
            follow_up_from: self.model_text.len(),
        });
    }

    fn close(self, conversation: &mut Conversation) {
        let Self { rounds, model_text } = self;
        for round in rounds.into_iter().rev() {
            conversation.replace_if(round.provisional, MessageRole::Assistant, round.reply);
            let follow_up = model_text.get(round.follow_up_from..).unwrap_or_default();
            conversation.append(MessageRole::Assistant, follow_up);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FragmentStream;
    use crate::mcp::provider::{ToolOutput, ToolProvider, ToolSpec};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Vec<Result<String, ChatError>>>>,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Vec<Result<String, ChatError>>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LlmDriver for Scripted {
        async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ChatError> {
            self.prompts.lock().unwrap().push(messages);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(reply)))
        }
    }

    #[derive(Debug)]
    struct Clock;

    #[async_trait]
    impl ToolProvider for Clock {
        fn name(&self) -> &str {
            "local"
        }

        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(vec![ToolSpec {
                name: "now".into(),
                description: "time".into(),
                parameter_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, _: &str, _: Map<String, Value>) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::text("12:00"))
        }
    }

    async fn orchestrator(driver: Arc<Scripted>, rounds: usize) -> Orchestrator {
        let registry =
            ToolRegistry::build("local", vec![Arc::new(Clock)], Duration::from_secs(1)).await;
        Orchestrator::new(
            driver,
            Arc::new(registry),
            OrchestratorSettings {
                base_system_prompt: "base".into(),
                max_tool_rounds: rounds,
            },
        )
    }

    fn ok(parts: &[&str]) -> Vec<Result<String, ChatError>> {
        parts.iter().map(|p| Ok((*p).to_string())).collect()
    }

    #[tokio::test]
    async fn test_prompt_excludes_stored_system_messages() {
        let driver = Scripted::new(vec![ok(&["hi"])]);
        let orch = orchestrator(Arc::clone(&driver), 2).await;
        let mut conv = Conversation::from_messages(vec![Message::system("old system")]);
        let (sink, _rx) = FrameSink::channel(16);

        orch.process(&mut conv, "hello", &sink).await.unwrap();

        let prompts = driver.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert_eq!(prompt[0].role, MessageRole::System);
        assert!(prompt[0].content.starts_with("base"));
        assert!(prompt[0].content.contains("Tool name: now"));
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[1], Message::user("hello"));
    }

    #[tokio::test]
    async fn test_depth_limit_stops_loop() {
        let call = r#"<tool>{"name":"now"}</tool>"#;
        let driver = Scripted::new(vec![ok(&[call]), ok(&[call]), ok(&[call])]);
        let orch = orchestrator(Arc::clone(&driver), 1).await;
        let mut conv = Conversation::new();
        let (sink, mut rx) = FrameSink::channel(64);

        let outcome = orch.process(&mut conv, "loop", &sink).await.unwrap();
        assert_eq!(outcome, TurnOutcome::DepthLimited);
        assert_eq!(driver.prompts.lock().unwrap().len(), 2);
        // user, assistant(call), user(result), assistant(call), assistant(closing)
        assert_eq!(conv.len(), 5);
        assert_eq!(conv.messages()[4], Message::assistant(call));

        drop(sink);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f.into_wire());
        }
        assert!(frames.last().unwrap().contains("Stopped after 1 tool rounds"));
    }

    #[tokio::test]
    async fn test_cancel_rolls_back_turn() {
        let driver = Scripted::new(vec![ok(&["a", "b"])]);
        let orch = orchestrator(driver, 2).await;
        let mut conv = Conversation::from_messages(vec![Message::user("x"), Message::assistant("y")]);
        let (sink, rx) = FrameSink::channel(1);
        drop(rx);

        let err = orch.process(&mut conv, "hello", &sink).await.unwrap_err();
        assert!(matches!(err, ChatError::Cancelled));
        assert_eq!(conv.len(), 2);
    }
}

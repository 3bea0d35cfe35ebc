//! Binds the session directory, per-session conversation state and the
//! orchestrator.
//!
//! Each session's [`Conversation`] sits behind its own async mutex, so turns
//! on one session run one at a time while different sessions proceed
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::ChatError;
use crate::llm::{LlmDriver, Message, Orchestrator, OrchestratorSettings, TurnOutcome};
use crate::mcp::registry::{RegistryGate, ToolRegistry};
use crate::protocol::{FrameSink, StreamFrame};

use super::{Conversation, SessionDirectory, SessionInfo};

pub struct ChatService {
    directory: Arc<dyn SessionDirectory>,
    driver: Arc<dyn LlmDriver>,
    gate: Arc<RegistryGate>,
    settings: OrchestratorSettings,
    conversations: Mutex<HashMap<i64, Arc<Mutex<Conversation>>>>,
    active: RwLock<i64>,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("directory", &self.directory)
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ChatService {
    /// Make sure a session exists and make the most recent one active.
    pub async fn start(
        directory: Arc<dyn SessionDirectory>,
        driver: Arc<dyn LlmDriver>,
        gate: Arc<RegistryGate>,
        settings: OrchestratorSettings,
    ) -> Result<Self, ChatError> {
        let active = directory.ensure_default().await?;
        tracing::info!(session_id = active, "Active session");

        Ok(Self {
            directory,
            driver,
            gate,
            settings,
            conversations: Mutex::new(HashMap::new()),
            active: RwLock::new(active),
        })
    }

    pub async fn active_session(&self) -> i64 {
        *self.active.read().await
    }

    /// Tool catalogue, connecting providers on first use.
    pub async fn tools(&self) -> Result<Arc<ToolRegistry>, ChatError> {
        self.gate.get().await
    }

    /// Conversation state for `id`, loaded from the directory on first access.
    ///
    /// The map is not locked while the history loads. When two callers load
    /// the same session, the first entry inserted wins.
    async fn conversation(&self, id: i64) -> Result<Arc<Mutex<Conversation>>, ChatError> {
        if let Some(conv) = self.conversations.lock().await.get(&id) {
            return Ok(Arc::clone(conv));
        }

        let messages = self.directory.get_messages(id).await?;
        let loaded = Arc::new(Mutex::new(Conversation::from_messages(messages)));
        let conv = self
            .conversations
            .lock()
            .await
            .entry(id)
            .or_insert(loaded)
            .clone();
        Ok(conv)
    }

    /// Run one turn on `session_id` (the active session when `None`).
    ///
    /// Frames go to `sink`, ending with `[DONE]` once the turn is persisted or
    /// with an error frame. The turn is persisted as a whole or not at all.
    pub async fn send_message(
        &self,
        session_id: Option<i64>,
        message: &str,
        sink: &FrameSink,
    ) -> Result<TurnOutcome, ChatError> {
        let id = match session_id {
            Some(id) => id,
            None => self.active_session().await,
        };

        let prepared = async {
            let registry = self.gate.get().await?;
            let conv = self.conversation(id).await?;
            Ok::<_, ChatError>((registry, conv))
        }
        .await;
        let (registry, conv) = match prepared {
            Ok(ready) => ready,
            Err(e) => return Err(report(sink, e).await),
        };

        let mut conv = conv.lock().await;
        let checkpoint = conv.len();
        let orchestrator =
            Orchestrator::new(Arc::clone(&self.driver), registry, self.settings.clone());

        // Errors from the orchestrator are already reported and rolled back.
        let outcome = orchestrator.process(&mut conv, message, sink).await?;

        if let Err(e) = self.directory.append_messages(id, conv.since(checkpoint)).await {
            tracing::error!(session_id = id, error = %e, "Failed to persist turn");
            conv.truncate(checkpoint);
            return Err(report(sink, e).await);
        }

        // The turn is stored; a caller that left before the sentinel changes nothing.
        let _ = sink.emit(StreamFrame::Done).await;
        Ok(outcome)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ChatError> {
        self.directory.list_sessions().await
    }

    /// Create a session and make it active.
    pub async fn create_session(&self, name: &str) -> Result<i64, ChatError> {
        let id = self.directory.create_session(name).await?;
        *self.active.write().await = id;
        Ok(id)
    }

    pub async fn rename_session(&self, id: i64, name: &str) -> Result<(), ChatError> {
        self.directory.rename_session(id, name).await
    }

    /// Delete a session. Deleting the active one activates the most recently
    /// updated remaining session.
    pub async fn delete_session(&self, id: i64) -> Result<(), ChatError> {
        self.directory.delete_session(id).await?;
        self.conversations.lock().await.remove(&id);

        let mut active = self.active.write().await;
        if *active == id {
            *active = self.directory.ensure_default().await?;
            tracing::info!(session_id = *active, "Active session moved after delete");
        }
        Ok(())
    }

    /// Make `id` active and return its history. An unknown id leaves the
    /// active session unchanged.
    pub async fn switch_session(&self, id: i64) -> Result<Vec<Message>, ChatError> {
        let conv = self.conversation(id).await?;
        let messages = conv.lock().await.snapshot();
        *self.active.write().await = id;
        tracing::info!(session_id = id, "Switched session");
        Ok(messages)
    }

    pub async fn messages(&self, id: i64) -> Result<Vec<Message>, ChatError> {
        let conv = self.conversation(id).await?;
        let messages = conv.lock().await.snapshot();
        Ok(messages)
    }

    /// Clear the history of `session_id` (the active session when `None`).
    pub async fn clear(&self, session_id: Option<i64>) -> Result<(), ChatError> {
        let id = match session_id {
            Some(id) => id,
            None => self.active_session().await,
        };
        let conv = self.conversation(id).await?;
        let mut conv = conv.lock().await;
        self.directory.clear_messages(id).await?;
        conv.clear();
        tracing::info!(session_id = id, "Cleared history");
        Ok(())
    }
}

async fn report(sink: &FrameSink, err: ChatError) -> ChatError {
    let _ = sink.emit(StreamFrame::Error(err.to_string())).await;
    err
}

//! In-process doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcp_chat::ChatError;
use mcp_chat::llm::{FragmentStream, LlmDriver, Message};
use mcp_chat::mcp::provider::{ToolOutput, ToolProvider, ToolSpec};
use mcp_chat::mcp::registry::ToolRegistry;
use mcp_chat::protocol::StreamFrame;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

pub type Reply = Vec<Result<String, ChatError>>;

/// Model double that plays back canned replies and records every prompt.
#[derive(Default)]
pub struct ScriptedDriver {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedDriver {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::default(),
        })
    }

    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ChatError> {
        self.prompts.lock().unwrap().push(messages);
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(reply)))
    }
}

/// Reply streamed as the given fragments.
pub fn reply(parts: &[&str]) -> Reply {
    parts.iter().map(|p| Ok((*p).to_string())).collect()
}

/// What a fake tool does when called.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Reply(String),
    Fail(String),
    Flagged(String),
    Hang,
}

/// Tool provider double that records the calls it receives.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    tools: Vec<(String, Behaviour)>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl FakeProvider {
    pub fn new(name: &str, tools: &[(&str, Behaviour)]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: tools
                .iter()
                .map(|(n, b)| ((*n).to_string(), b.clone()))
                .collect(),
            calls: Mutex::default(),
        })
    }

    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(self
            .tools
            .iter()
            .map(|(name, _)| ToolSpec {
                name: name.clone(),
                description: format!("{name} tool"),
                parameter_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        parameters: Map<String, Value>,
    ) -> anyhow::Result<ToolOutput> {
        self.calls.lock().unwrap().push((name.to_string(), parameters));
        let behaviour = self
            .tools
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| anyhow::anyhow!("no tool {name}"))?;

        match behaviour {
            Behaviour::Reply(text) => Ok(ToolOutput::text(text)),
            Behaviour::Fail(message) => Err(anyhow::anyhow!(message)),
            Behaviour::Flagged(text) => Ok(ToolOutput {
                is_error: true,
                ..ToolOutput::text(text)
            }),
            Behaviour::Hang => std::future::pending().await,
        }
    }
}

pub async fn registry(providers: Vec<Arc<dyn ToolProvider>>, timeout: Duration) -> ToolRegistry {
    ToolRegistry::build("local", providers, timeout).await
}

/// Drain every frame still queued on a closed channel.
pub async fn drain(mut rx: mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

//! Built-in tools served in-process under the local provider name.
//!
//! These keep unprefixed names in the catalogue (`get_current_time`,
//! `read_file`, …) and need no external server.

pub mod files;
pub mod time;
pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::mcp::provider::{ToolOutput, ToolProvider, ToolSpec};

pub use files::{ReadFileTool, WriteFileTool};
pub use time::CurrentTimeTool;
pub use web::{FetchWebContentTool, SearchWebTool};

const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant backed by MCP tools.
You can call tools over the Model Context Protocol to extend what you can do.
Help the user as well as you can, and use tools whenever they are needed.";

#[async_trait]
pub trait NativeTool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

/// Provider hosting the built-in [`NativeTool`]s.
#[derive(Debug)]
pub struct LocalToolProvider {
    name: String,
    tools: Vec<Arc<dyn NativeTool>>,
    system_prompt: String,
}

impl LocalToolProvider {
    /// The standard tool set. `search_url` points at a `SearXNG` instance.
    pub fn standard(name: impl Into<String>, search_url: Option<String>) -> anyhow::Result<Self> {
        let tools: Vec<Arc<dyn NativeTool>> = vec![
            Arc::new(SearchWebTool::new(search_url)?),
            Arc::new(CurrentTimeTool),
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(FetchWebContentTool::new()?),
        ];
        Ok(Self::with_tools(name, tools))
    }

    pub fn with_tools(name: impl Into<String>, tools: Vec<Arc<dyn NativeTool>>) -> Self {
        Self {
            name: name.into(),
            tools,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Replace the base system prompt this provider offers.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl ToolProvider for LocalToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameter_schema: t.schema(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| anyhow::anyhow!("no built-in tool named '{name}'"))?;

        let value = tool.call(Value::Object(arguments)).await?;
        Ok(match value {
            Value::String(s) => ToolOutput::text(s),
            other => ToolOutput::text(other.to_string()),
        })
    }

    async fn system_prompt(&self) -> anyhow::Result<Option<String>> {
        Ok(Some(self.system_prompt.clone()))
    }
}

/// Required string argument.
pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing string argument '{key}'"))
}

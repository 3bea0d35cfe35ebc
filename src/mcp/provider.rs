//! Tool providers: anything that can list tools and run them.
//!
//! Remote MCP servers are reached through `rmcp`; the built-in local tools
//! implement the same trait in-process (see [`crate::mcp::native`]).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::ServiceExt,
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::mcp::config::{McpServerEntry, expand_env_map, expand_env_placeholders};

/// A tool as advertised by its provider, before any prefixing.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}

/// One piece of heterogeneous tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSegment {
    Text(String),
    /// Reference to a resource, rendered as its URI.
    Link(String),
}

/// Everything a provider returned for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub segments: Vec<ContentSegment>,
    /// The provider flagged the call as failed.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segments: vec![ContentSegment::Text(text.into())],
            is_error: false,
        }
    }

    /// Flatten recognised segments into one text blob.
    #[must_use]
    pub fn joined(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                ContentSegment::Text(t) | ContentSegment::Link(t) => t.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Normalise an MCP `CallToolResult` (as JSON).
    ///
    /// `text` items become text, `resource_link` items and embedded
    /// `resource` items become their text or URI. Anything else (images,
    /// audio) is skipped.
    #[must_use]
    pub fn from_call_result(value: &Value) -> Self {
        let mut segments = Vec::new();
        let items = value
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = item.get("text").and_then(Value::as_str) {
                        segments.push(ContentSegment::Text(t.to_string()));
                    }
                }
                Some("resource_link") => {
                    if let Some(uri) = item.get("uri").and_then(Value::as_str) {
                        segments.push(ContentSegment::Link(uri.to_string()));
                    }
                }
                Some("resource") => {
                    let resource = &item["resource"];
                    if let Some(t) = resource.get("text").and_then(Value::as_str) {
                        segments.push(ContentSegment::Text(t.to_string()));
                    } else if let Some(uri) = resource.get("uri").and_then(Value::as_str) {
                        segments.push(ContentSegment::Link(uri.to_string()));
                    }
                }
                other => tracing::debug!(kind = ?other, "Skipping unsupported tool content"),
            }
        }

        Self {
            segments,
            is_error: value.get("isError").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

#[async_trait]
pub trait ToolProvider: Send + Sync + std::fmt::Debug {
    /// Provider (server) name used for prefixing.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
    -> anyhow::Result<ToolOutput>;

    /// Base system message offered by this provider, if any.
    async fn system_prompt(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

type DynClientService = rmcp::service::RunningService<
    rmcp::service::RoleClient,
    Box<dyn rmcp::service::DynService<rmcp::service::RoleClient>>,
>;

/// A connected MCP server.
pub struct McpServiceProvider {
    name: String,
    service: Arc<DynClientService>,
}

impl std::fmt::Debug for McpServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServiceProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl McpServiceProvider {
    /// Spawn or dial the server described by `entry` and run the MCP handshake.
    pub async fn connect(name: &str, entry: &McpServerEntry) -> anyhow::Result<Self> {
        let svc = match entry {
            McpServerEntry::Stdio { command, args, env } => {
                let env = expand_env_map(env);

                let mut cmd = Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = TokioChildProcess::new(cmd)?;
                ().into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to connect stdio MCP server '{name}'"))?
            }

            McpServerEntry::RemoteHttp {
                url,
                headers: raw_headers,
                env,
            } => {
                let env = expand_env_map(env);
                let mut headers = HeaderMap::new();
                for (k, v) in raw_headers {
                    // Entry-level env first, then the process environment.
                    let value = env
                        .iter()
                        .fold(v.clone(), |acc, (ek, ev)| acc.replace(&format!("${{{ek}}}"), ev));
                    headers.insert(
                        HeaderName::from_bytes(k.as_bytes())
                            .with_context(|| format!("invalid header name '{k}' for '{name}'"))?,
                        HeaderValue::from_str(&expand_env_placeholders(&value))
                            .with_context(|| format!("invalid value for header '{k}' of '{name}'"))?,
                    );
                }

                let transport = if headers.is_empty() {
                    StreamableHttpClientTransport::from_uri(url.as_str())
                } else {
                    let client = reqwest::Client::builder()
                        .default_headers(headers)
                        .build()?;
                    StreamableHttpClientTransport::with_client(
                        client,
                        StreamableHttpClientTransportConfig::with_uri(url.as_str()),
                    )
                };

                ().into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to connect remote MCP server '{name}'"))?
            }
        };

        Ok(Self {
            name: name.to_string(),
            service: Arc::new(svc),
        })
    }
}

#[async_trait]
impl ToolProvider for McpServiceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let result = self
            .service
            .list_tools(Option::default())
            .await
            .with_context(|| format!("tools/list failed for MCP server '{}'", self.name))?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name.to_string(),
                description: t.description.as_deref().unwrap_or_default().to_string(),
                parameter_schema: Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> anyhow::Result<ToolOutput> {
        let res = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .with_context(|| format!("tools/call failed for {}:{name}", self.name))?;

        Ok(ToolOutput::from_call_result(&serde_json::to_value(res)?))
    }
}

/// Connect every configured server except `skip`, logging and skipping failures.
pub async fn connect_all(
    servers: &HashMap<String, McpServerEntry>,
    skip: &str,
) -> Vec<Arc<dyn ToolProvider>> {
    let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
    let mut names: Vec<_> = servers.keys().collect();
    names.sort();

    for name in names {
        if name == skip {
            tracing::warn!(server = %name, "Ignoring configured server shadowing the built-in provider");
            continue;
        }
        match McpServiceProvider::connect(name, &servers[name]).await {
            Ok(p) => {
                tracing::info!(server = %name, "Connected MCP server");
                providers.push(Arc::new(p));
            }
            Err(e) => tracing::error!(server = %name, error = %e, "Skipping MCP server"),
        }
    }
    providers
}

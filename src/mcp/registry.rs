//! Aggregated tool catalogue.
//!
//! Every provider's tools are collected into one [`ToolRegistry`]. Local tools
//! keep their names; tools of any other server are advertised as
//! `server_name:tool_name`. Calls are routed to the provider a catalogue entry
//! was registered from. [`RegistryGate`] builds the registry lazily, once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::error::ChatError;
use crate::mcp::provider::{ToolProvider, ToolSpec};

/// Separator between provider name and local tool name.
pub const PREFIX_SEPARATOR: char = ':';

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub description: String,
    pub parameter_schema: Value,
}

#[derive(Debug, Clone)]
struct ToolOrigin {
    provider: String,
    local_name: String,
}

/// Row of the `/api/tools` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub full_name: String,
    pub description: String,
}

/// Aggregated tool catalogue across all providers.
///
/// Tools of the local provider keep their names; every other provider's
/// tools are exposed as `<provider>:<tool>`.
pub struct ToolRegistry {
    local_provider: String,
    providers: HashMap<String, Arc<dyn ToolProvider>>,
    catalogue: Vec<ToolDescriptor>,
    origins: Vec<ToolOrigin>,
    // qualified_name -> position in catalogue
    index: HashMap<String, usize>,
    call_timeout: Duration,
    system_prompt: Option<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("local_provider", &self.local_provider)
            .field("provider_count", &self.providers.len())
            .field("tool_count", &self.catalogue.len())
            .finish_non_exhaustive()
    }
}

impl ToolRegistry {
    pub fn new(local_provider: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            local_provider: local_provider.into(),
            providers: HashMap::new(),
            catalogue: Vec::new(),
            origins: Vec::new(),
            index: HashMap::new(),
            call_timeout,
            system_prompt: None,
        }
    }

    /// Query every provider and register whatever it offers.
    ///
    /// A provider whose catalogue cannot be listed is logged and left out.
    /// The local provider's `system_prompt` becomes the base system prompt.
    pub async fn build(
        local_provider: &str,
        providers: Vec<Arc<dyn ToolProvider>>,
        call_timeout: Duration,
    ) -> Self {
        let mut registry = Self::new(local_provider, call_timeout);

        for provider in providers {
            let name = provider.name().to_string();
            let tools = match provider.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to list tools, skipping provider");
                    continue;
                }
            };

            if name == registry.local_provider {
                match provider.system_prompt().await {
                    Ok(prompt) => registry.system_prompt = prompt,
                    Err(e) => tracing::warn!(server = %name, error = %e, "Failed to fetch system prompt"),
                }
            }

            tracing::info!(server = %name, tool_count = tools.len(), "Registered tools");
            registry.register(provider, tools);
        }

        registry
    }

    /// Add one provider's tools. A qualified name that is already present is
    /// overwritten by the newer registration.
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>, tools: Vec<ToolSpec>) {
        let provider_name = provider.name().to_string();
        let is_local = provider_name == self.local_provider;

        for tool in tools {
            let (qualified_name, description) = if is_local {
                (tool.name.clone(), tool.description)
            } else {
                (
                    format!("{provider_name}{PREFIX_SEPARATOR}{}", tool.name),
                    format!("[{provider_name}] {}", tool.description),
                )
            };

            if is_local && self.resolve(&qualified_name).0 != provider_name {
                tracing::warn!(
                    tool = %qualified_name,
                    "Local tool name looks like a prefixed server tool; calls follow the catalogue entry"
                );
            }

            let descriptor = ToolDescriptor {
                qualified_name: qualified_name.clone(),
                description,
                parameter_schema: tool.parameter_schema,
            };
            let origin = ToolOrigin {
                provider: provider_name.clone(),
                local_name: tool.name,
            };

            if let Some(&pos) = self.index.get(&qualified_name) {
                tracing::warn!(
                    tool = %qualified_name,
                    server = %provider_name,
                    previous_server = %self.origins[pos].provider,
                    "Duplicate tool name, overwriting"
                );
                self.catalogue[pos] = descriptor;
                self.origins[pos] = origin;
            } else {
                self.index.insert(qualified_name, self.catalogue.len());
                self.catalogue.push(descriptor);
                self.origins.push(origin);
            }
        }

        self.providers.insert(provider_name, provider);
    }

    /// Split a qualified name into `(provider, local_name)`.
    ///
    /// Only a name with exactly one separator whose left part is a known
    /// provider is split. Anything else belongs to the local provider as a
    /// whole, so `unknown:thing` resolves to the local tool `unknown:thing`.
    pub fn resolve<'a>(&'a self, qualified_name: &'a str) -> (&'a str, &'a str) {
        if qualified_name.matches(PREFIX_SEPARATOR).count() == 1
            && let Some((prefix, local)) = qualified_name.split_once(PREFIX_SEPARATOR)
            && self.providers.contains_key(prefix)
        {
            return (prefix, local);
        }
        (self.local_provider.as_str(), qualified_name)
    }

    /// Run a tool and flatten its output to text.
    ///
    /// Names outside the catalogue fail with [`ChatError::ToolNotFound`];
    /// provider failures, provider-flagged errors and timeouts fail with
    /// [`ChatError::ToolExecution`].
    pub async fn invoke(
        &self,
        qualified_name: &str,
        parameters: Map<String, Value>,
    ) -> Result<String, ChatError> {
        let origin = self
            .index
            .get(qualified_name)
            .map(|&pos| &self.origins[pos])
            .ok_or_else(|| ChatError::ToolNotFound(qualified_name.to_string()))?;
        let provider_name = origin.provider.as_str();
        let local_name = origin.local_name.as_str();
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ChatError::ToolNotFound(qualified_name.to_string()))?;

        tracing::debug!(tool = %qualified_name, server = %provider_name, "Invoking tool");

        match tokio::time::timeout(self.call_timeout, provider.call_tool(local_name, parameters))
            .await
        {
            Err(_) => Err(ChatError::tool_execution(
                qualified_name,
                format!("timed out after {}s", self.call_timeout.as_secs_f32()),
            )),
            Ok(Err(e)) => Err(ChatError::tool_execution(qualified_name, format!("{e:#}"))),
            Ok(Ok(output)) if output.is_error => {
                Err(ChatError::tool_execution(qualified_name, output.joined()))
            }
            Ok(Ok(output)) => Ok(output.joined()),
        }
    }

    #[must_use]
    pub fn catalogue(&self) -> &[ToolDescriptor] {
        &self.catalogue
    }

    /// Base system prompt offered by the local provider.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Catalogue grouped by originating provider. Every registered provider
    /// is listed, even one without tools.
    #[must_use]
    pub fn tools_by_server(&self) -> BTreeMap<String, Vec<ToolSummary>> {
        let mut out: BTreeMap<String, Vec<ToolSummary>> = self
            .providers
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (descriptor, origin) in self.catalogue.iter().zip(&self.origins) {
            out.entry(origin.provider.clone())
                .or_default()
                .push(ToolSummary {
                    name: origin.local_name.clone(),
                    full_name: descriptor.qualified_name.clone(),
                    description: descriptor.description.clone(),
                });
        }
        out
    }
}

type RegistryInit = Box<dyn Fn() -> BoxFuture<'static, Result<ToolRegistry, ChatError>> + Send + Sync>;

/// One-shot initialisation gate for the registry.
///
/// The first caller runs `init`; concurrent callers wait on the same
/// attempt and then share its result. A failed attempt is not memoised, the
/// next caller tries again.
pub struct RegistryGate {
    cell: OnceCell<Arc<ToolRegistry>>,
    init: RegistryInit,
}

impl std::fmt::Debug for RegistryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryGate")
            .field("initialized", &self.cell.initialized())
            .finish_non_exhaustive()
    }
}

impl RegistryGate {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<ToolRegistry, ChatError>> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            init: Box::new(init),
        }
    }

    /// A gate that is already open.
    pub fn ready(registry: ToolRegistry) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Arc::new(registry))),
            init: Box::new(|| {
                Box::pin(async { Err(ChatError::Config("registry already initialized".into())) })
            }),
        }
    }

    pub async fn get(&self) -> Result<Arc<ToolRegistry>, ChatError> {
        self.cell
            .get_or_try_init(|| async { (self.init)().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::provider::ToolOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct EchoProvider {
        name: String,
        delay: Duration,
    }

    impl EchoProvider {
        fn new(name: &str) -> Arc<dyn ToolProvider> {
            Arc::new(Self {
                name: name.to_string(),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl ToolProvider for EchoProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(vec![spec("echo"), spec("fail")])
        }

        async fn call_tool(&self, name: &str, args: Map<String, Value>) -> anyhow::Result<ToolOutput> {
            tokio::time::sleep(self.delay).await;
            match name {
                "fail" => anyhow::bail!("fail was called"),
                _ => Ok(ToolOutput::text(format!("{}:{name}:{}", self.name, Value::Object(args)))),
            }
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameter_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn registry() -> ToolRegistry {
        ToolRegistry::build(
            "local",
            vec![EchoProvider::new("local"), EchoProvider::new("web")],
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_prefixing() {
        let reg = registry().await;
        let names: Vec<_> = reg.catalogue().iter().map(|d| d.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fail", "web:echo", "web:fail"]);
        assert_eq!(reg.catalogue()[2].description, "[web] echo tool");
    }

    #[tokio::test]
    async fn test_resolve() {
        let reg = registry().await;
        assert_eq!(reg.resolve("web:echo"), ("web", "echo"));
        assert_eq!(reg.resolve("echo"), ("local", "echo"));
        // Unknown prefix stays whole.
        assert_eq!(reg.resolve("news:echo"), ("local", "news:echo"));
        // More than one separator is never split.
        assert_eq!(reg.resolve("web:a:b"), ("local", "web:a:b"));
    }

    #[tokio::test]
    async fn test_invoke_routes_to_provider() {
        let reg = registry().await;
        let mut args = Map::new();
        args.insert("q".into(), Value::from("x"));
        let out = reg.invoke("web:echo", args).await.unwrap();
        assert_eq!(out, r#"web:echo:{"q":"x"}"#);
    }

    #[tokio::test]
    async fn test_invoke_errors() {
        let reg = registry().await;
        assert!(matches!(
            reg.invoke("news:echo", Map::new()).await,
            Err(ChatError::ToolNotFound(_))
        ));
        match reg.invoke("fail", Map::new()).await {
            Err(ChatError::ToolExecution { tool, message }) => {
                assert_eq!(tool, "fail");
                assert!(message.contains("fail was called"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_timeout() {
        let slow: Arc<dyn ToolProvider> = Arc::new(EchoProvider {
            name: "local".into(),
            delay: Duration::from_secs(30),
        });
        let reg = ToolRegistry::build("local", vec![slow], Duration::from_secs(1)).await;
        let err = reg.invoke("echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::ToolExecution { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_duplicate_overwrites() {
        let mut reg = ToolRegistry::new("local", Duration::from_secs(1));
        let provider = EchoProvider::new("local");
        reg.register(Arc::clone(&provider), vec![spec("echo")]);
        let mut newer = spec("echo");
        newer.description = "newer".into();
        reg.register(provider, vec![newer]);
        assert_eq!(reg.catalogue().len(), 1);
        assert_eq!(reg.catalogue()[0].description, "newer");
    }

    #[tokio::test]
    async fn test_tools_by_server() {
        let reg = registry().await;
        let grouped = reg.tools_by_server();
        assert_eq!(grouped["web"][0].name, "echo");
        assert_eq!(grouped["web"][0].full_name, "web:echo");
        assert_eq!(grouped["local"].len(), 2);
    }

    #[tokio::test]
    async fn test_server_without_tools_is_listed() {
        let mut reg = registry().await;
        reg.register(EchoProvider::new("empty"), Vec::new());
        let grouped = reg.tools_by_server();
        assert!(grouped["empty"].is_empty());
        assert_eq!(grouped.len(), 3);
    }

    #[tokio::test]
    async fn test_invoke_follows_the_registered_entry() {
        let mut reg = ToolRegistry::new("local", Duration::from_secs(1));
        reg.register(EchoProvider::new("web"), vec![spec("echo")]);
        // A local tool whose literal name collides with the prefixed one.
        reg.register(EchoProvider::new("local"), vec![spec("web:echo")]);

        assert_eq!(reg.catalogue().len(), 1);
        let out = reg.invoke("web:echo", Map::new()).await.unwrap();
        assert_eq!(out, "local:web:echo:{}");
    }

    #[tokio::test]
    async fn test_gate_initializes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = Arc::new(RegistryGate::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(ToolRegistry::new("local", Duration::from_secs(1)))
            })
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.get().await.map(|_| ()) })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.is_initialized());
    }

    #[tokio::test]
    async fn test_gate_retries_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = RegistryGate::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(ChatError::Config("first attempt".into()))
                } else {
                    Ok(ToolRegistry::new("local", Duration::from_secs(1)))
                }
            })
        });
        assert!(gate.get().await.is_err());
        assert!(gate.get().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

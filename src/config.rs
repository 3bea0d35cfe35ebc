use std::env;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::llm::{LlmSettings, OrchestratorSettings, orchestrator::DEFAULT_BASE_PROMPT};

/// Config file picked up from the working directory when none is given.
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment names understood in addition to the `CHAT_` prefixed keys.
const PLAIN_ENV_KEYS: &[(&str, &str)] = &[
    ("LLM_API_URL", "llm.api_url"),
    ("LLM_API_MODEL", "llm.model"),
    ("LLM_API_KEY", "llm.api_key"),
    ("SEARXNG_URL", "tools.search_url"),
    ("MCP_SERVERS_FILE", "tools.servers_file"),
    ("DATABASE_URL", "storage.database_url"),
];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", global = true)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "HOST", global = true)]
    pub host: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Run the web server (default)
    #[default]
    Serve,
    /// Chat in the terminal
    Chat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    pub servers_file: String,
    pub local_provider: String,
    pub call_timeout_secs: u64,
    pub max_tool_rounds: usize,
    #[serde(default)]
    pub search_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
}

impl AppConfig {
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    /// Defaults < config file < `CHAT_*` env < plain env names < CLI flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        // 1. Defaults
        let mut builder = Config::builder()
            .set_default("server.port", 5000)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("llm.api_url", "https://api.openai.com/v1/chat/completions")?
            .set_default("llm.model", "gpt-3.5-turbo")?
            .set_default("llm.temperature", 0.7)?
            .set_default("llm.max_tokens", 40960)?
            .set_default("tools.servers_file", "mcpServers.json")?
            .set_default("tools.local_provider", "local")?
            .set_default("tools.call_timeout_secs", 60)?
            .set_default("tools.max_tool_rounds", 8)?
            .set_default("storage.database_url", "sqlite://conversations.db?mode=rwc")?;

        // 2. Config file
        match &cli.config {
            Some(path) => builder = builder.add_source(File::with_name(path).required(true)),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
            None => {}
        }

        // 3. Prefixed environment, e.g. CHAT_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("CHAT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Plain environment names
        for (var, key) in PLAIN_ENV_KEYS {
            if let Ok(val) = env::var(var)
                && !val.trim().is_empty()
            {
                builder = builder.set_override(*key, val)?;
            }
        }

        // 5. CLI flags (and their env fallbacks)
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(host) = &cli.host {
            builder = builder.set_override("server.host", host.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            api_url: self.llm.api_url.clone(),
            api_key: self.llm.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            base_system_prompt: self
                .llm
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_PROMPT.to_string()),
            max_tool_rounds: self.tools.max_tool_rounds,
        }
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.call_timeout_secs)
    }

    #[must_use]
    pub fn search_url(&self) -> Option<String> {
        self.tools.search_url.clone().filter(|u| !u.trim().is_empty())
    }
}

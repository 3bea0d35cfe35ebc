//! Tool providers and the tool registry.
//!
//! Tools come from two kinds of provider: the in-process local provider
//! ([`native`]) and MCP servers reached over stdio or streamable HTTP
//! ([`provider`]).
//!
//! # Configuration
//!
//! MCP servers are configured via `mcpServers.json`:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": {
//!       "command": "npx",
//!       "args": ["-y", "@mcpcentral/mcp-time"]
//!     },
//!     "tavily": {
//!       "url": "https://mcp.tavily.com/mcp/",
//!       "headers": { "Authorization": "Bearer ${TAVILY_API_KEY}" }
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Namespacing
//!
//! Local tools keep their bare names. Tools of other providers are prefixed
//! with the provider name: `server_name:tool_name` (e.g. `time:now`).

pub mod config;
pub mod native;
pub mod provider;
pub mod registry;

//! mcp-broker: a host-side broker for Model Context Protocol servers.
//!
//! The broker manages the lifecycle of configured MCP servers, keeps a
//! persistent catalogue and tool cache, enforces enable/disable policy, and
//! exposes a small REST control plane for upstream clients. Embedding hosts
//! mount [`web_server::router`] under their own prefix; the bundled binary
//! serves it standalone.

pub mod mcp;        // MCP client runtime: transports, correlator, state machine
pub mod registry;   // Process-wide name -> client map
pub mod settings;   // Persistent settings store (mcp_settings.json)
pub mod tools;      // Tool cache coordinator
pub mod web_server; // Control-plane REST surface

// Re-export commonly used types
pub use mcp::{McpClient, McpError, McpResult};
pub use registry::ConnectionRegistry;
pub use settings::{McpSettings, ServerEntry, SettingsStore};
pub use tools::ToolCache;
pub use web_server::{router, AppState};

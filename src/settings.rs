//! Persistent settings store: the server catalogue, enable/disable policy,
//! and the per-server tool cache, all in one JSON document.
//!
//! The file lives at `<root>/mcp_settings.json`. It is created with empty
//! defaults on first read, forward-migrated when keys are missing, and
//! rewritten atomically (temp file + rename) so a crash mid-write never
//! leaves a torn document. There is no in-memory cache; every caller
//! re-reads.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::transport::TransportConfig;
use crate::mcp::types::Tool;

pub const SETTINGS_FILE: &str = "mcp_settings.json";

/// One configured MCP server. The transport fields sit at the same level as
/// `name` in the persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: TransportConfig,
}

impl ServerEntry {
    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::InvalidConfig(
                "server name must not be empty".to_string(),
            ));
        }
        self.config.validate()
    }
}

/// The whole settings document. Missing keys deserialize to their empty
/// defaults (forward migration); unknown top-level keys are carried in
/// `extra` and written back untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpSettings {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerEntry>,
    #[serde(rename = "disabledServers", default)]
    pub disabled_servers: Vec<String>,
    #[serde(rename = "disabledTools", default)]
    pub disabled_tools: BTreeMap<String, Vec<String>>,
    #[serde(rename = "cachedTools", default)]
    pub cached_tools: BTreeMap<String, Vec<Tool>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl McpSettings {
    pub fn is_server_disabled(&self, name: &str) -> bool {
        self.disabled_servers.iter().any(|n| n == name)
    }

    pub fn is_tool_disabled(&self, server: &str, tool: &str) -> bool {
        self.disabled_tools
            .get(server)
            .map(|tools| tools.iter().any(|t| t == tool))
            .unwrap_or(false)
    }

    /// Remove a server and everything keyed by it. `disabledServers` is
    /// left alone; stale names there are tolerated.
    pub fn remove_server(&mut self, name: &str) -> bool {
        let existed = self.mcp_servers.remove(name).is_some();
        self.disabled_tools.remove(name);
        self.cached_tools.remove(name);
        existed
    }
}

/// Handle on the settings file. Cheap to clone; holds no state beyond the
/// path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

fn store_error(context: &str, err: impl std::fmt::Display) -> McpError {
    McpError::Internal {
        message: format!("settings {}: {}", context, err),
        data: None,
    }
}

impl SettingsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: root.into().join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings document, creating it with empty defaults if it
    /// does not exist yet.
    pub fn load(&self) -> McpResult<McpSettings> {
        if !self.path.exists() {
            info!("Creating settings file at {}", self.path.display());
            let defaults = McpSettings::default();
            self.save(&defaults)?;
            return Ok(defaults);
        }

        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| store_error("read", e))?;
        let settings: McpSettings =
            serde_json::from_str(&text).map_err(|e| store_error("parse", e))?;
        Ok(settings)
    }

    /// Serialize with 4-space indentation and atomically replace the file.
    pub fn save(&self, settings: &McpSettings) -> McpResult<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| store_error("path", "settings path has no parent directory"))?;
        std::fs::create_dir_all(parent).map_err(|e| store_error("mkdir", e))?;

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        settings
            .serialize(&mut serializer)
            .map_err(|e| store_error("serialize", e))?;
        buf.push(b'\n');

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| store_error("tempfile", e))?;
        tmp.write_all(&buf).map_err(|e| store_error("write", e))?;
        tmp.flush().map_err(|e| store_error("flush", e))?;
        tmp.persist(&self.path)
            .map_err(|e| store_error("rename", e))?;

        debug!("Settings written to {}", self.path.display());
        Ok(())
    }
}

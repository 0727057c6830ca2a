//! Tool cache coordinator: keeps the persisted tool descriptors in step
//! with what servers actually expose, and annotates them with enablement
//! for the control plane.
//!
//! Listing never requires the server to be running; a reload connects
//! temporarily (via the registry) when no live client exists.

use log::info;
use serde_json::Value;
use std::sync::Arc;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::types::Tool;
use crate::registry::ConnectionRegistry;
use crate::settings::{McpSettings, SettingsStore};

pub struct ToolCache {
    registry: Arc<ConnectionRegistry>,
    store: SettingsStore,
}

impl ToolCache {
    pub fn new(registry: Arc<ConnectionRegistry>, store: SettingsStore) -> Self {
        Self { registry, store }
    }

    /// Fetch the live tool list for `name`, persist it, and return the
    /// annotated descriptors. The server is started temporarily if needed.
    /// On failure the previously cached descriptors stay in place.
    pub async fn reload(&self, name: &str) -> McpResult<Vec<Value>> {
        let settings = self.store.load()?;
        let entry = settings
            .mcp_servers
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::InvalidRequest(format!("unknown server '{}'", name)))?;

        let listed = self
            .registry
            .temporary(name, &entry.config, |client| async move {
                client.list_tools().await
            })
            .await?;

        info!("Cached {} tool(s) for '{}'", listed.tools.len(), name);

        // Re-read before writing; another handler may have mutated the
        // document while we were talking to the server.
        let mut settings = self.store.load()?;
        settings
            .cached_tools
            .insert(name.to_string(), listed.tools.clone());
        self.store.save(&settings)?;

        Ok(annotate(&listed.tools, &settings, name))
    }

    /// Cached descriptors for `name`, each annotated with `_enabled`. An
    /// empty cache triggers exactly one implicit reload.
    pub async fn list_with_status(&self, name: &str) -> McpResult<Vec<Value>> {
        let settings = self.store.load()?;
        let cached = settings.cached_tools.get(name).cloned().unwrap_or_default();
        if cached.is_empty() {
            return self.reload(name).await;
        }
        Ok(annotate(&cached, &settings, name))
    }
}

/// Serialize descriptors with the `_enabled` flag derived from the
/// disabled-tools policy.
fn annotate(tools: &[Tool], settings: &McpSettings, server: &str) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let enabled = !settings.is_tool_disabled(server, &tool.name);
            let mut value = serde_json::to_value(tool).unwrap_or(Value::Null);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("_enabled".to_string(), Value::Bool(enabled));
            }
            value
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::TransportConfig;
    use crate::settings::ServerEntry;
    use std::collections::HashMap;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({ "type": "object" }),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_annotate_marks_disabled_tools() {
        let mut settings = McpSettings::default();
        settings
            .disabled_tools
            .insert("echo".to_string(), vec!["write".to_string()]);

        let annotated = annotate(&[tool("read"), tool("write")], &settings, "echo");
        assert_eq!(annotated[0]["_enabled"], true);
        assert_eq!(annotated[1]["_enabled"], false);
        assert_eq!(annotated[1]["name"], "write");
    }

    #[tokio::test]
    async fn test_list_with_status_serves_cache_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let mut settings = store.load().unwrap();
        settings.mcp_servers.insert(
            "echo".to_string(),
            ServerEntry {
                name: "echo".to_string(),
                config: TransportConfig::Stdio {
                    command: "/nonexistent".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                },
            },
        );
        settings
            .cached_tools
            .insert("echo".to_string(), vec![tool("echo")]);
        store.save(&settings).unwrap();

        // The command cannot be spawned, so this only succeeds because the
        // cache is served without touching the server.
        let cache = ToolCache::new(Arc::new(ConnectionRegistry::new()), store);
        let listed = cache.list_with_status("echo").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["_enabled"], true);
    }

    #[tokio::test]
    async fn test_empty_cache_triggers_reload_and_failure_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let mut settings = store.load().unwrap();
        settings.mcp_servers.insert(
            "echo".to_string(),
            ServerEntry {
                name: "echo".to_string(),
                config: TransportConfig::Stdio {
                    command: "/nonexistent".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                },
            },
        );
        store.save(&settings).unwrap();

        let cache = ToolCache::new(Arc::new(ConnectionRegistry::new()), store.clone());
        assert!(cache.list_with_status("echo").await.is_err());

        // The failed reload left the (empty) cache untouched.
        let settings = store.load().unwrap();
        assert!(settings.cached_tools.get("echo").is_none());
    }

    #[tokio::test]
    async fn test_reload_unknown_server() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let cache = ToolCache::new(Arc::new(ConnectionRegistry::new()), store);
        assert!(cache.reload("ghost").await.is_err());
    }
}

//! Connection registry: the process-wide map from server name to live
//! client.
//!
//! Each name owns a slot guarded by its own async mutex, so start, stop and
//! temporary connections on one server serialize while other servers
//! proceed concurrently. The registry is created at startup and passed to
//! handlers explicitly; `teardown` closes everything it still owns.

use dashmap::DashMap;
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::mcp::client::McpClient;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::transport::{build_transport, TransportConfig};
use crate::mcp::types::ServerCapabilities;

type Slot = Arc<Mutex<Option<Arc<McpClient>>>>;

/// A running server as seen from the outside.
#[derive(Debug, Clone)]
pub struct RunningServer {
    pub name: String,
    pub capabilities: Option<ServerCapabilities>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    slots: DashMap<String, Slot>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Build a client for `entry`, run the handshake, and tear everything
    /// down on failure so no half-open connection leaks.
    async fn connect_client(name: &str, config: &TransportConfig) -> McpResult<Arc<McpClient>> {
        let transport = build_transport(name, config)?;
        let client = Arc::new(McpClient::new(name, transport));
        match client.connect().await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Start a server. Fails with [`McpError::AlreadyRunning`] if a client
    /// for this name already exists; on handshake failure nothing is
    /// inserted.
    pub async fn start(&self, name: &str, config: &TransportConfig) -> McpResult<Arc<McpClient>> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            if existing.is_ready() {
                return Err(McpError::AlreadyRunning(name.to_string()));
            }
            // Client died under us; reap it before restarting.
            warn!("Reaping dead client for '{}'", name);
            existing.close().await;
            *guard = None;
        }

        let client = Self::connect_client(name, config).await?;
        *guard = Some(client.clone());
        info!("Started MCP server '{}'", name);
        Ok(client)
    }

    /// Stop a server. Returns whether a client was actually running.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(slot) = self.slots.get(name).map(|s| s.value().clone()) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(client) => {
                client.close().await;
                info!("Stopped MCP server '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Get the live client for a name. A client whose transport died is
    /// reaped here so callers see a clean "not running" instead of stale
    /// state.
    pub async fn get(&self, name: &str) -> Option<Arc<McpClient>> {
        let slot = self.slots.get(name).map(|s| s.value().clone())?;
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(client) if client.is_ready() => Some(client.clone()),
            Some(client) => {
                warn!("Reaping dead client for '{}'", name);
                client.close().await;
                *guard = None;
                None
            }
            None => None,
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.get(name).await.is_some()
    }

    /// Run `action` against a client for `name`, starting the server
    /// temporarily if it is not already running. A server started here is
    /// stopped again on the way out, on both success and failure paths. The
    /// name's slot stays locked for the duration, so concurrent lifecycle
    /// operations on the same name wait.
    pub async fn temporary<F, Fut, T>(
        &self,
        name: &str,
        config: &TransportConfig,
        action: F,
    ) -> McpResult<T>
    where
        F: FnOnce(Arc<McpClient>) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;

        if let Some(client) = guard.as_ref() {
            if client.is_ready() {
                return action(client.clone()).await;
            }
            client.close().await;
            *guard = None;
        }

        let client = Self::connect_client(name, config).await?;
        info!("Temporarily connected to '{}'", name);
        let result = action(client.clone()).await;
        client.close().await;
        result
    }

    /// Snapshot of every running server and its negotiated capabilities.
    pub async fn snapshot(&self) -> Vec<RunningServer> {
        let mut running = Vec::new();
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (name, slot) in slots {
            let guard = slot.lock().await;
            if let Some(client) = guard.as_ref() {
                if client.is_ready() {
                    running.push(RunningServer {
                        name,
                        capabilities: client.server_capabilities(),
                    });
                }
            }
        }
        running
    }

    /// Close every client. Called once at plugin shutdown.
    pub async fn teardown(&self) {
        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop(&name).await;
        }
        info!("Connection registry torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn bad_stdio_config() -> TransportConfig {
        // Spawning this fails immediately, which exercises the
        // nothing-inserted-on-error path without a real server.
        TransportConfig::Stdio {
            command: "/nonexistent/mcp-server-binary".to_string(),
            args: vec![],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_failed_start_inserts_nothing() {
        let registry = ConnectionRegistry::new();
        let err = registry.start("ghost", &bad_stdio_config()).await;
        assert!(err.is_err());
        assert!(registry.get("ghost").await.is_none());
        assert!(!registry.is_running("ghost").await);
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.stop("nope").await);
    }

    #[tokio::test]
    async fn test_temporary_propagates_connect_failure() {
        let registry = ConnectionRegistry::new();
        let result = registry
            .temporary("ghost", &bad_stdio_config(), |_client| async move {
                Ok(serde_json::json!({}))
            })
            .await;
        assert!(result.is_err());
        assert!(!registry.is_running("ghost").await);
    }

    #[tokio::test]
    async fn test_snapshot_empty() {
        let registry = ConnectionRegistry::new();
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = ConnectionRegistry::new();
        let config = TransportConfig::Sse {
            url: "not-a-url".to_string(),
            headers: HashMap::new(),
        };
        let err = registry.start("bad", &config).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));
    }
}

//! Transport abstraction for MCP connections.
//!
//! All three transports expose the same framed contract: `open` installs an
//! inbound message sink and acquires the OS-level resource, `send` writes one
//! JSON value, `close` tears the resource down. Inbound frames arrive on the
//! sink in arrival order; the sink being dropped is the signal that the
//! transport's read side died.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::error::{McpError, McpResult};

/// Channel on which a transport delivers inbound JSON-RPC messages to the
/// owning client. Bounded so a flooding server backpressures the reader
/// instead of growing memory.
pub type MessageSink = mpsc::Sender<serde_json::Value>;

/// Capacity of the inbound message channel.
pub const SINK_CAPACITY: usize = 128;

/// Per-server transport configuration, as persisted in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "streamableHttp")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamableHttp",
        }
    }

    /// Validate the configuration before it is persisted or used.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::InvalidConfig(
                        "stdio server requires a command".to_string(),
                    ));
                }
            }
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                url::Url::parse(url)?;
            }
        }
        Ok(())
    }
}

/// The capability set shared by all transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Acquire the underlying resource and start delivering inbound messages
    /// to `sink`. Called exactly once, before any `send`.
    async fn open(&mut self, sink: MessageSink) -> McpResult<()>;

    /// Write one framed JSON value to the transport.
    async fn send(&self, message: &serde_json::Value) -> McpResult<()>;

    /// Tear down the underlying resource. Idempotent.
    async fn close(&mut self) -> McpResult<()>;

    /// Transport kind name for logging.
    fn kind(&self) -> &'static str;

    /// Record the negotiated protocol version. Remote transports attach it
    /// to subsequent HTTP requests; stdio has no use for it.
    fn set_protocol_version(&self, _version: &str) {}
}

/// Construct the transport for a server entry. `name` is only used to label
/// log output.
pub fn build_transport(name: &str, config: &TransportConfig) -> McpResult<Box<dyn McpTransport>> {
    config.validate()?;
    match config {
        TransportConfig::Stdio { command, args, env } => Ok(Box::new(
            super::stdio::StdioTransport::new(name, command, args.clone(), env.clone()),
        )),
        TransportConfig::Sse { url, headers } => Ok(Box::new(super::sse::SseTransport::new(
            name,
            url,
            headers.clone(),
        )?)),
        TransportConfig::StreamableHttp { url, headers } => Ok(Box::new(
            super::streamable_http::StreamableHttpTransport::new(name, url, headers.clone())?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tag_round_trip() {
        let config = TransportConfig::StreamableHttp {
            url: "https://mcp.example.com/mcp".to_string(),
            headers: HashMap::new(),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "streamableHttp");
        assert!(json.get("headers").is_none());

        let back: TransportConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "streamableHttp");
    }

    #[test]
    fn test_stdio_requires_command() {
        let config = TransportConfig::Stdio {
            command: "  ".to_string(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(matches!(
            config.validate(),
            Err(McpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_remote_requires_absolute_url() {
        let config = TransportConfig::Sse {
            url: "/relative/path".to_string(),
            headers: HashMap::new(),
        };
        assert!(config.validate().is_err());

        let config = TransportConfig::Sse {
            url: "http://localhost:3000/sse".to_string(),
            headers: HashMap::new(),
        };
        assert!(config.validate().is_ok());
    }
}

//! MCP (Model Context Protocol) client runtime.
//!
//! This module implements the client side of the protocol:
//! - Three transports: stdio subprocess, SSE with a POST sidecar, and the
//!   unified streamable HTTP endpoint
//! - JSON-RPC request/response correlation
//! - The initialize/initialized handshake and connection state machine
//! - Typed `tools/list` and `tools/call` operations with result unwrapping

pub mod client;
pub mod error;
pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod transport;
pub mod types;

pub use client::{unwrap_tool_result, validate_tool_arguments, ClientState, McpClient, RequestOptions};
pub use error::{McpError, McpResult};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use transport::{build_transport, McpTransport, TransportConfig};
pub use types::*;

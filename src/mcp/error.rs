//! Error types for MCP operations.
//!
//! Every error maps onto the stable JSON-RPC numeric taxonomy via
//! [`McpError::code`], so the control plane can surface `{code, message,
//! data}` bodies without guessing.

use thiserror::Error;

pub const CODE_PARSE_ERROR: i32 = -32700;
pub const CODE_INVALID_REQUEST: i32 = -32600;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_INTERNAL_ERROR: i32 = -32603;
pub const CODE_CONNECTION_CLOSED: i32 = -32000;
pub const CODE_REQUEST_TIMEOUT: i32 = -32001;
pub const CODE_UNSUPPORTED_PROTOCOL_VERSION: i32 = -32002;

/// MCP-specific errors.
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    /// Error object reported by the server, carried verbatim.
    #[error("Server error {code}: {message}")]
    Protocol {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Server already running: {0}")]
    AlreadyRunning(String),

    /// The HTTP session id the transport held is no longer valid. Handled
    /// inside the client (re-handshake + one retry), never surfaced.
    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl McpError {
    /// Stable numeric code for this error. Local variants fold into the
    /// nearest wire code; server-reported errors keep the code they came
    /// with.
    pub fn code(&self) -> i32 {
        match self {
            McpError::Parse(_) => CODE_PARSE_ERROR,
            McpError::InvalidRequest(_) => CODE_INVALID_REQUEST,
            McpError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => CODE_INVALID_PARAMS,
            McpError::Internal { .. } => CODE_INTERNAL_ERROR,
            McpError::ConnectionClosed(_) => CODE_CONNECTION_CLOSED,
            McpError::RequestTimeout(_) => CODE_REQUEST_TIMEOUT,
            McpError::UnsupportedProtocolVersion(_) => CODE_UNSUPPORTED_PROTOCOL_VERSION,
            McpError::Protocol { code, .. } => *code,
            McpError::Transport(_) => CODE_CONNECTION_CLOSED,
            McpError::NotConnected => CODE_CONNECTION_CLOSED,
            McpError::AlreadyRunning(_) => CODE_INVALID_REQUEST,
            McpError::SessionExpired => CODE_CONNECTION_CLOSED,
            McpError::InvalidConfig(_) => CODE_INVALID_PARAMS,
        }
    }

    /// Optional structured payload attached to the error.
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            McpError::Internal { data, .. } | McpError::Protocol { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::RequestTimeout(0)
        } else if err.is_connect() {
            McpError::ConnectionClosed(err.to_string())
        } else {
            McpError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for McpError {
    fn from(err: url::ParseError) -> Self {
        McpError::InvalidConfig(format!("Invalid URL: {}", err))
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

/// Result type alias for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

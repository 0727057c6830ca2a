//! Streamable HTTP transport: a single endpoint that answers each POST with
//! either one JSON body or a short SSE stream.
//!
//! There is no persistent inbound channel; whatever the response carries is
//! parsed and delivered through the inbound sink, and the correlator matches
//! it up by id like any other transport. Session state is the
//! `Mcp-Session-Id` header: captured from the `initialize` response and
//! attached to every subsequent request. A 404 while holding a session id
//! means the server expired it; the transport clears the id and reports
//! [`McpError::SessionExpired`] so the owning client can re-handshake and
//! retry once.

use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::RwLock;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::error::{McpError, McpResult};
use super::sse::parse_sse_event;
use super::transport::{McpTransport, MessageSink};

pub struct StreamableHttpTransport {
    name: String,
    http: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    sink: RwLock<Option<MessageSink>>,
}

impl StreamableHttpTransport {
    pub fn new(name: &str, url: &str, headers: HashMap<String, String>) -> McpResult<Self> {
        let endpoint = Url::parse(url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            http,
            endpoint,
            headers,
            session_id: RwLock::new(None),
            sink: RwLock::new(None),
        })
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get("mcp-session-id") {
            if let Ok(sid) = value.to_str() {
                let mut current = self.session_id.write();
                if current.as_deref() != Some(sid) {
                    info!("[{}] session id: {}", self.name, sid);
                    *current = Some(sid.to_string());
                }
            }
        }
    }

    async fn deliver(&self, message: serde_json::Value) -> McpResult<()> {
        let sink = self.sink.read().clone().ok_or(McpError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|_| McpError::ConnectionClosed("inbound sink closed".to_string()))
    }

    /// Parse a `text/event-stream` response body and deliver each `data`
    /// payload as an inbound message.
    async fn drain_event_stream(&self, response: reqwest::Response) -> McpResult<()> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find("\n\n") {
                let block = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();
                self.deliver_event_block(&block).await?;
            }
        }
        // Streams from some servers end without a trailing blank line.
        if !buffer.trim().is_empty() {
            self.deliver_event_block(&buffer).await?;
        }
        Ok(())
    }

    async fn deliver_event_block(&self, block: &str) -> McpResult<()> {
        let Some(event) = parse_sse_event(block) else {
            return Ok(());
        };
        match serde_json::from_str::<serde_json::Value>(&event.data) {
            Ok(message) => {
                debug!("[{}] <- {}", self.name, event.data);
                self.deliver(message).await
            }
            Err(e) => {
                warn!("[{}] unparseable event dropped: {}", self.name, e);
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn open(&mut self, sink: MessageSink) -> McpResult<()> {
        info!("Using streamable HTTP endpoint {} for '{}'", self.endpoint, self.name);
        *self.sink.write() = Some(sink);
        Ok(())
    }

    async fn send(&self, message: &serde_json::Value) -> McpResult<()> {
        let held_session = self.session_id.read().clone();

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(ref sid) = held_session {
            request = request.header("Mcp-Session-Id", sid.as_str());
        }
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        debug!("[{}] -> {}", self.name, message);
        let response = request.json(message).send().await.map_err(McpError::from)?;
        self.capture_session_id(&response);

        let status = response.status();
        if status == StatusCode::NOT_FOUND && held_session.is_some() {
            // Session expired server-side. Clear it; the client re-runs the
            // handshake and retries the original request once.
            warn!("[{}] session expired (HTTP 404)", self.name);
            *self.session_id.write() = None;
            return Err(McpError::SessionExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {}: {}", status, body)));
        }

        // 202/204 acknowledge a notification; there is nothing to deliver.
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.drain_event_stream(response).await
        } else {
            let body = response.text().await.map_err(McpError::from)?;
            if body.trim().is_empty() {
                return Ok(());
            }
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(parsed) => {
                    debug!("[{}] <- {}", self.name, body.trim());
                    self.deliver(parsed).await
                }
                Err(e) => {
                    warn!("[{}] unparseable response dropped: {}", self.name, e);
                    Ok(())
                }
            }
        }
    }

    async fn close(&mut self) -> McpResult<()> {
        *self.sink.write() = None;
        *self.session_id.write() = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "streamableHttp"
    }
}

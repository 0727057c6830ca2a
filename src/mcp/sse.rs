//! SSE transport: an event-stream subscription for inbound messages plus a
//! POST sidecar channel for outbound ones.
//!
//! The first event on the stream has type `endpoint` and carries a relative
//! URL whose query string holds the session id. Outbound messages are POSTed
//! to that endpoint with `sessionId` re-attached; inbound messages arrive as
//! the `data` of `message` events.

use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::error::{McpError, McpResult};
use super::transport::{McpTransport, MessageSink};
use super::types::SseEvent;

/// How long `open` waits for the server to announce its POST endpoint.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

/// POST channel discovered from the `endpoint` event: the sessionId-less
/// base URL plus the opaque session id to re-attach per request.
#[derive(Debug, Clone)]
struct PostEndpoint {
    url: Url,
    session_id: String,
}

pub struct SseTransport {
    name: String,
    http: reqwest::Client,
    stream_url: Url,
    headers: HashMap<String, String>,
    endpoint: Arc<RwLock<Option<PostEndpoint>>>,
    protocol_version: Arc<RwLock<Option<String>>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(name: &str, url: &str, headers: HashMap<String, String>) -> McpResult<Self> {
        let stream_url = Url::parse(url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            http,
            stream_url,
            headers,
            endpoint: Arc::new(RwLock::new(None)),
            protocol_version: Arc::new(RwLock::new(None)),
            reader: None,
        })
    }
}

/// Parse one SSE event block (the text between blank-line separators).
pub(crate) fn parse_sse_event(text: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();
    let mut id = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim());
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
        }
    }

    if data.is_empty() {
        None
    } else {
        Some(SseEvent { event, data, id })
    }
}

/// Split the `endpoint` event payload into the POST base URL (sessionId
/// stripped, other query parameters kept) and the session id itself.
fn split_endpoint(base: &Url, data: &str) -> McpResult<PostEndpoint> {
    let resolved = base.join(data)?;
    let session_id = resolved
        .query_pairs()
        .find(|(k, _)| k == "sessionId")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| {
            McpError::Transport("endpoint event carried no sessionId".to_string())
        })?;

    let retained: Vec<(String, String)> = resolved
        .query_pairs()
        .filter(|(k, _)| k != "sessionId")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = resolved.clone();
    url.set_query(None);
    if !retained.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &retained {
            pairs.append_pair(k, v);
        }
    }

    Ok(PostEndpoint { url, session_id })
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn open(&mut self, sink: MessageSink) -> McpResult<()> {
        info!("Opening SSE stream for '{}' at {}", self.name, self.stream_url);

        let mut request = self
            .http
            .get(self.stream_url.clone())
            .header("Accept", "text/event-stream");
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request.send().await.map_err(McpError::from)?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "SSE subscription failed: HTTP {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = tokio::sync::oneshot::channel::<PostEndpoint>();
        let name = self.name.clone();
        let base = self.stream_url.clone();
        let mut endpoint_tx = Some(endpoint_tx);

        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("[{}] SSE stream error: {}", name, e);
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(end) = buffer.find("\n\n") {
                    let block = buffer[..end].to_string();
                    buffer = buffer[end + 2..].to_string();

                    let Some(event) = parse_sse_event(&block) else {
                        continue;
                    };
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            if let Some(tx) = endpoint_tx.take() {
                                match split_endpoint(&base, &event.data) {
                                    Ok(endpoint) => {
                                        let _ = tx.send(endpoint);
                                    }
                                    Err(e) => {
                                        warn!("[{}] bad endpoint event: {}", name, e);
                                    }
                                }
                            }
                        }
                        Some("message") | None => {
                            match serde_json::from_str::<serde_json::Value>(&event.data) {
                                Ok(message) => {
                                    debug!("[{}] <- {}", name, event.data);
                                    if sink.send(message).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!("[{}] unparseable event dropped: {}", name, e);
                                }
                            }
                        }
                        Some(other) => {
                            debug!("[{}] ignoring event type '{}'", name, other);
                        }
                    }
                }
            }
            info!("[{}] SSE stream closed", name);
        });
        self.reader = Some(reader);

        let endpoint = tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx)
            .await
            .map_err(|_| {
                McpError::Transport("server never announced its POST endpoint".to_string())
            })?
            .map_err(|_| {
                McpError::ConnectionClosed("SSE stream ended before endpoint event".to_string())
            })?;

        info!(
            "[{}] POST endpoint {} (session {})",
            self.name, endpoint.url, endpoint.session_id
        );
        *self.endpoint.write() = Some(endpoint);
        Ok(())
    }

    async fn send(&self, message: &serde_json::Value) -> McpResult<()> {
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or(McpError::NotConnected)?;

        let mut url = endpoint.url.clone();
        url.query_pairs_mut()
            .append_pair("sessionId", &endpoint.session_id);

        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(version) = self.protocol_version.read().as_deref() {
            request = request.header("MCP-Protocol-Version", version);
        }
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        debug!("[{}] -> {}", self.name, message);
        let response = request.json(message).send().await.map_err(McpError::from)?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "POST sidecar returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> McpResult<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.endpoint.write() = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sse"
    }

    fn set_protocol_version(&self, version: &str) {
        *self.protocol_version.write() = Some(version.to_string());
    }
}

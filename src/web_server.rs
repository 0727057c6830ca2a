//! Control-plane REST surface.
//!
//! A thin, stateless set of handlers over the registry and the settings
//! store. The library exposes [`router`] so an embedding host can mount the
//! routes under its own prefix; the standalone binary serves them directly.
//!
//! Secrets stay server-side: `env` for stdio servers and `headers` for
//! remote ones are never serialized into a response.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::mcp::error::McpError;
use crate::registry::ConnectionRegistry;
use crate::settings::{ServerEntry, SettingsStore};
use crate::tools::ToolCache;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: SettingsStore,
}

impl AppState {
    pub fn new(registry: Arc<ConnectionRegistry>, store: SettingsStore) -> Self {
        Self { registry, store }
    }

    fn tool_cache(&self) -> ToolCache {
        ToolCache::new(self.registry.clone(), self.store.clone())
    }
}

/// Error response: an HTTP status plus a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<McpError> for ApiError {
    /// Surfaced MCP errors become a 500 carrying the stable numeric code
    /// and whatever structured payload the error holds.
    fn from(err: McpError) -> Self {
        error!("MCP operation failed: {}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "code": err.code(),
                "message": err.to_string(),
                "data": err.data().cloned().unwrap_or(Value::Null),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/servers", get(list_servers).post(add_server))
        .route("/servers/disabled", post(set_disabled_servers))
        .route("/servers/{name}", delete(delete_server))
        .route("/servers/{name}/start", post(start_server))
        .route("/servers/{name}/stop", post(stop_server))
        .route("/servers/{name}/list-tools", get(list_tools))
        .route("/servers/{name}/disabled-tools", post(set_disabled_tools))
        .route("/servers/{name}/reload-tools", post(reload_tools))
        .route("/servers/{name}/call-tool", post(call_tool))
        .route("/servers/{name}/health", get(server_health))
        .with_state(state)
}

/// The externally visible slice of a server's configuration. Environment
/// variables and request headers are withheld.
fn public_config(entry: &ServerEntry) -> Value {
    use crate::mcp::transport::TransportConfig::*;
    match &entry.config {
        Stdio { command, args, .. } => {
            json!({ "type": "stdio", "command": command, "args": args })
        }
        Sse { url, .. } => json!({ "type": "sse", "url": url }),
        StreamableHttp { url, .. } => json!({ "type": "streamableHttp", "url": url }),
    }
}

async fn list_servers(State(state): State<AppState>) -> ApiResult {
    let settings = state.store.load()?;
    let running = state.registry.snapshot().await;

    let mut servers = Vec::with_capacity(settings.mcp_servers.len());
    for (name, entry) in &settings.mcp_servers {
        let capabilities = running
            .iter()
            .find(|r| &r.name == name)
            .map(|r| r.capabilities.clone());
        let is_running = capabilities.is_some();

        let mut server = json!({
            "name": name,
            "isRunning": is_running,
            "config": public_config(entry),
            "enabled": !settings.is_server_disabled(name),
            "disabledTools": settings.disabled_tools.get(name).cloned().unwrap_or_default(),
            "cachedTools": settings.cached_tools.get(name).cloned().unwrap_or_default(),
        });
        if let Some(Some(caps)) = capabilities {
            server["capabilities"] = serde_json::to_value(caps).unwrap_or(Value::Null);
        }
        servers.push(server);
    }
    Ok(Json(Value::Array(servers)))
}

async fn add_server(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let name = body
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| ApiError::bad_request("name is required"))?
        .to_string();
    let config = body
        .get("config")
        .cloned()
        .ok_or_else(|| ApiError::bad_request("config is required"))?;
    let config = serde_json::from_value(config)
        .map_err(|e| ApiError::bad_request(format!("invalid config: {}", e)))?;

    let entry = ServerEntry {
        name: name.clone(),
        config,
    };
    entry
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut settings = state.store.load()?;
    if settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("server '{}' already exists", name),
        ));
    }
    settings.mcp_servers.insert(name.clone(), entry);
    state.store.save(&settings)?;

    info!("Added MCP server '{}'", name);
    Ok(Json(json!({})))
}

async fn delete_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    // Stop first so a client mid-handshake is torn down before its entry
    // disappears from the document.
    state.registry.stop(&name).await;

    let mut settings = state.store.load()?;
    if settings.remove_server(&name) {
        state.store.save(&settings)?;
        info!("Deleted MCP server '{}'", name);
    }
    Ok(Json(json!({})))
}

async fn set_disabled_servers(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let disabled = parse_string_array(&body, "disabledServers")?;

    let mut settings = state.store.load()?;
    settings.disabled_servers = disabled;
    state.store.save(&settings)?;
    Ok(Json(json!({})))
}

async fn start_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let settings = state.store.load()?;
    let entry = settings
        .mcp_servers
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("unknown server '{}'", name)))?;
    if settings.is_server_disabled(&name) {
        return Err(ApiError::forbidden(format!("server '{}' is disabled", name)));
    }

    match state.registry.start(&name, &entry.config).await {
        Ok(_) => Ok(Json(json!({}))),
        Err(McpError::AlreadyRunning(_)) => {
            Err(ApiError::bad_request(format!("server '{}' is already running", name)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn stop_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    if state.registry.stop(&name).await {
        Ok(Json(json!({})))
    } else {
        Err(ApiError::bad_request(format!("server '{}' is not running", name)))
    }
}

async fn list_tools(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let settings = state.store.load()?;
    if !settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::not_found(format!("unknown server '{}'", name)));
    }
    let tools = state.tool_cache().list_with_status(&name).await?;
    Ok(Json(Value::Array(tools)))
}

async fn set_disabled_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let disabled = parse_string_array(&body, "disabledTools")?;

    let mut settings = state.store.load()?;
    if !settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::not_found(format!("unknown server '{}'", name)));
    }
    settings.disabled_tools.insert(name, disabled);
    state.store.save(&settings)?;
    Ok(Json(json!({})))
}

async fn reload_tools(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let settings = state.store.load()?;
    if !settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::not_found(format!("unknown server '{}'", name)));
    }
    let tools = state.tool_cache().reload(&name).await?;
    Ok(Json(Value::Array(tools)))
}

async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let settings = state.store.load()?;
    if !settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::not_found(format!("unknown server '{}'", name)));
    }

    let tool_name = body
        .get("toolName")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ApiError::bad_request("toolName is required"))?
        .to_string();
    let arguments = body.get("arguments").cloned();

    if settings.is_tool_disabled(&name, &tool_name) {
        return Err(ApiError::forbidden("This tool is disabled"));
    }

    let client = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::bad_request(format!("server '{}' is not running", name)))?;

    // The cached descriptor supplies the schema; fall back to a live
    // listing before declaring the tool unknown.
    let cached = settings.cached_tools.get(&name).cloned().unwrap_or_default();
    let descriptor = match cached.iter().find(|t| t.name == tool_name).cloned() {
        Some(descriptor) => descriptor,
        None => {
            let listed = client.list_tools().await?;
            listed
                .tools
                .into_iter()
                .find(|t| t.name == tool_name)
                .ok_or_else(|| ApiError::not_found(format!("tool '{}' not found", tool_name)))?
        }
    };

    let data = client
        .call_tool(&tool_name, arguments, Some(&descriptor.input_schema))
        .await?;

    Ok(Json(json!({
        "result": {
            "toolName": tool_name,
            "status": "executed",
            "data": data,
        }
    })))
}

async fn server_health(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let settings = state.store.load()?;
    if !settings.mcp_servers.contains_key(&name) {
        return Err(ApiError::not_found(format!("unknown server '{}'", name)));
    }
    let client = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::bad_request(format!("server '{}' is not running", name)))?;

    let start = Instant::now();
    client.ping().await?;
    Ok(Json(json!({
        "status": "healthy",
        "latencyMs": start.elapsed().as_millis() as u64,
    })))
}

/// Extract a `[string]` field, reporting a 400 on missing or wrongly-typed
/// input.
fn parse_string_array(body: &Value, field: &str) -> Result<Vec<String>, ApiError> {
    let items = body
        .get(field)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ApiError::bad_request(format!("{} must be an array", field)))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| ApiError::bad_request(format!("{} must contain strings", field)))
        })
        .collect()
}

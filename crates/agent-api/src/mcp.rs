//! Minimal MCP client for the streamable-HTTP transport.
//!
//! Every logical call opens a session (`initialize` followed by the
//! `notifications/initialized` notification), issues its JSON-RPC request
//! and closes the session again. Servers may answer a request either with a
//! plain JSON body or with a `text/event-stream` body carrying the response
//! as an SSE `data:` line.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const PROCESS_VIDEO_TOOL: &str = "process_video";

#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed mcp message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("mcp error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("mcp response carried neither result nor error")]
    MissingResult,

    #[error("no response with id {0} in event stream")]
    NoResponse(u64),

    #[error("tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },

    #[error("tool `{0}` returned no text content")]
    EmptyResult(String),
}

/// The remote video-processing capability used by the background processor.
#[async_trait]
pub trait VideoTool: Send + Sync {
    /// Processes the video at `path` and returns a reference to the artifact.
    async fn process_video(&self, path: &Path) -> Result<String, McpError>;
}

#[derive(Serialize, Debug)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Serialize, Debug)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

#[derive(Deserialize, Debug)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A tool advertised by the server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl CallToolResult {
    /// Concatenated text blocks of the result; non-text blocks are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug)]
pub struct McpClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, McpError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let session = self.connect().await?;
        let tools = session.list_tools().await;
        session.close().await;
        tools
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let session = self.connect().await?;
        let result = session.call_tool(name, arguments).await;
        session.close().await;
        result
    }

    async fn connect(&self) -> Result<McpSession<'_>, McpError> {
        let mut session = McpSession {
            client: self,
            session_id: None,
        };
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let (session_id, response) = session.post("initialize", params).await?;
        into_result(response)?;
        session.session_id = session_id;
        session.notify("notifications/initialized").await?;
        debug!(endpoint = %self.endpoint, session_id = ?session.session_id, "mcp session open");
        Ok(session)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl VideoTool for McpClient {
    async fn process_video(&self, path: &Path) -> Result<String, McpError> {
        let arguments = json!({ "video_path": path.to_string_lossy() });
        let result = self.call_tool(PROCESS_VIDEO_TOOL, arguments).await?;
        let text = result.text();
        if result.is_error {
            return Err(McpError::Tool {
                tool: PROCESS_VIDEO_TOOL.to_owned(),
                message: text,
            });
        }
        let reference = text.trim();
        if reference.is_empty() {
            return Err(McpError::EmptyResult(PROCESS_VIDEO_TOOL.to_owned()));
        }
        Ok(reference.to_owned())
    }
}

struct McpSession<'a> {
    client: &'a McpClient,
    session_id: Option<String>,
}

impl McpSession<'_> {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let (_, response) = self.post("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(into_result(response)?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let (_, response) = self.post("tools/call", params).await?;
        Ok(serde_json::from_value(into_result(response)?)?)
    }

    async fn post(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(Option<String>, JsonRpcResponse), McpError> {
        let id = self.client.next_id();
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let response = self
            .request(self.client.http.post(&self.client.endpoint))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response.text().await?;

        let parsed = if is_stream {
            parse_event_stream(&text, id)?
        } else {
            serde_json::from_str(&text)?
        };
        Ok((session_id, parsed))
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let body = JsonRpcNotification {
            jsonrpc: "2.0",
            method,
        };
        self.request(self.client.http.post(&self.client.endpoint))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close(self) {
        if self.session_id.is_none() {
            return;
        }
        let result = self
            .request(self.client.http.delete(&self.client.endpoint))
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to close mcp session");
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(ACCEPT, "application/json, text/event-stream");
        match &self.session_id {
            Some(id) => builder.header(SESSION_HEADER, id),
            None => builder,
        }
    }
}

fn into_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    response.result.ok_or(McpError::MissingResult)
}

/// Finds the JSON-RPC response with the given id in an SSE body, skipping
/// notifications and server requests interleaved with it.
pub(crate) fn parse_event_stream(body: &str, id: u64) -> Result<JsonRpcResponse, McpError> {
    let wanted = Value::from(id);
    let mut data = String::new();

    // A trailing empty line flushes the last event even without a final newline.
    for line in body.lines().chain(std::iter::once("")) {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            continue;
        }
        if !line.is_empty() || data.is_empty() {
            continue;
        }

        let event = std::mem::take(&mut data);
        match serde_json::from_str::<JsonRpcResponse>(&event) {
            Ok(message) if message.id.as_ref() == Some(&wanted) => return Ok(message),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "skipping unparsable event"),
        }
    }
    Err(McpError::NoResponse(id))
}

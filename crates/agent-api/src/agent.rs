//! Conversational agent behind the `/chat` endpoint.
//!
//! [`GroqAgent`] talks to an OpenAI-compatible chat-completions API, keeps a
//! bounded conversation memory and lets the model call the MCP server's
//! tools.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::mcp::{McpClient, McpError, ToolDescriptor};

/// Upper bound on model/tool round trips for a single user message.
const MAX_TOOL_ROUNDS: usize = 4;

const SYSTEM_PROMPT: &str = "You are a helpful assistant for questions about videos. \
When the user refers to a video, use the available tools to inspect it. \
If no video has been provided, answer from general knowledge and say so.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("llm transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("llm api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("llm response contained no choices")]
    EmptyResponse,

    #[error("gave up after {0} tool rounds")]
    ToolLoop(usize),

    #[error("tool discovery failed: {0}")]
    Tools(#[from] McpError),
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// One-time preparation such as tool discovery. Safe to call repeatedly.
    async fn setup(&self) -> Result<(), AgentError>;

    async fn chat(&self, message: &str, video_path: Option<&str>) -> Result<String, AgentError>;

    async fn reset_memory(&self);
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Maximum number of remembered messages (user and assistant turns).
    pub memory_size: usize,
    /// MCP tools the model may call; others are hidden from it.
    pub active_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_owned(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn tool(call_id: &str, content: String) -> Self {
        Self {
            tool_call_id: Some(call_id.to_owned()),
            ..Self::text("tool", content)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_owned()
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

pub struct GroqAgent {
    http: reqwest::Client,
    config: AgentConfig,
    mcp: Option<Arc<McpClient>>,
    tools: OnceCell<Vec<ToolDescriptor>>,
    memory: Mutex<VecDeque<ChatMessage>>,
}

impl GroqAgent {
    pub fn new(config: AgentConfig, mcp: Option<Arc<McpClient>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            mcp,
            tools: OnceCell::new(),
            memory: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn memory_len(&self) -> usize {
        self.memory.lock().await.len()
    }

    fn tool_specs(&self) -> Vec<Value> {
        self.tools
            .get()
            .map(|tools| {
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description.clone().unwrap_or_default(),
                                "parameters": tool.input_schema,
                            }
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<ChatMessage, AgentError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            tools: self.tool_specs(),
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(AgentError::EmptyResponse)
    }

    /// Tool failures are reported back to the model rather than aborting the chat.
    async fn invoke_tool(&self, call: &ToolCall) -> String {
        let name = call.function.name.as_str();
        let known = self
            .tools
            .get()
            .is_some_and(|tools| tools.iter().any(|t| t.name == name));
        let Some(mcp) = self.mcp.as_ref().filter(|_| known) else {
            return format!("tool `{name}` is not available");
        };

        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| json!({}));
        debug!(tool = name, %arguments, "calling tool");
        match mcp.call_tool(name, arguments).await {
            Ok(result) if result.is_error => format!("tool `{name}` failed: {}", result.text()),
            Ok(result) => result.text(),
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                format!("tool `{name}` failed: {e}")
            }
        }
    }

    /// Appends one exchange and drops the oldest whole exchanges until the
    /// memory fits, so it always starts with a user turn.
    fn remember(&self, memory: &mut VecDeque<ChatMessage>, user: ChatMessage, reply: &str) {
        memory.push_back(user);
        memory.push_back(ChatMessage::text("assistant", reply));
        while memory.len() > self.config.memory_size {
            memory.pop_front();
            while memory.front().is_some_and(|m| m.role != "user") {
                memory.pop_front();
            }
        }
    }
}

#[async_trait]
impl Agent for GroqAgent {
    async fn setup(&self) -> Result<(), AgentError> {
        let Some(mcp) = self.mcp.as_ref() else {
            return Ok(());
        };
        self.tools
            .get_or_try_init(|| async {
                let tools: Vec<ToolDescriptor> = mcp
                    .list_tools()
                    .await?
                    .into_iter()
                    .filter(|t| self.config.active_tools.iter().any(|name| *name == t.name))
                    .collect();
                info!(
                    tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                    "agent tools ready"
                );
                Ok::<_, AgentError>(tools)
            })
            .await?;
        Ok(())
    }

    async fn chat(&self, message: &str, video_path: Option<&str>) -> Result<String, AgentError> {
        let content = match video_path {
            Some(path) => format!("{message}\n\nVideo under discussion: {path}"),
            None => message.to_owned(),
        };
        let user = ChatMessage::text("user", content);

        // Held for the whole exchange so concurrent chats do not interleave turns.
        let mut memory = self.memory.lock().await;
        let mut messages = Vec::with_capacity(memory.len() + 2);
        messages.push(ChatMessage::text("system", SYSTEM_PROMPT));
        messages.extend(memory.iter().cloned());
        messages.push(user.clone());

        for _ in 0..MAX_TOOL_ROUNDS {
            let reply = self.complete(messages.clone()).await?;
            if reply.tool_calls.is_empty() {
                let text = reply.content.unwrap_or_default();
                self.remember(&mut memory, user, &text);
                return Ok(text);
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in &calls {
                let output = self.invoke_tool(call).await;
                messages.push(ChatMessage::tool(&call.id, output));
            }
        }
        Err(AgentError::ToolLoop(MAX_TOOL_ROUNDS))
    }

    async fn reset_memory(&self) {
        self.memory.lock().await.clear();
        info!("agent memory cleared");
    }
}

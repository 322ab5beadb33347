//! Model-service boundary and the Anthropic Messages client behind it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::ModelServiceError;
use crate::retry::RetryPolicy;
use crate::types::{ActionCatalog, ActionRequest, ActionResult, ContentBlock, Message};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const COMPUTER_USE_BETA: &str = "computer-use-2025-01-24";
const NATIVE_TOOL_TYPE: &str = "computer_20250124";
const OMITTED_IMAGE: &str = "[older screenshot omitted]";

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub catalog: &'a ActionCatalog,
    pub history: &'a [Message],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: Option<String>,
}

impl ModelResponse {
    /// All text blocks, joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool calls in the order the model issued them.
    pub fn action_requests(&self) -> Vec<ActionRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ActionRequest {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                ContentBlock::Text { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelServiceError>;
}

pub struct AnthropicClient {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
    max_tokens: u32,
    native_tool: bool,
    keep_recent_images: usize,
}

impl AnthropicClient {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            native_tool: config.native_tool,
            keep_recent_images: config.keep_recent_images,
        }
    }

    fn payload(&self, request: &ModelRequest<'_>) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "tools": [tool_definition(request.catalog, self.native_tool)],
            "messages": wire_messages(request.history, self.keep_recent_images),
        })
    }
}

#[async_trait]
impl ModelService for AnthropicClient {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ModelServiceError::MissingApiKey)?;
        let payload = self.payload(request);
        debug!(
            "[brain] sending {} messages to {}",
            request.history.len(),
            self.model
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", COMPUTER_USE_BETA)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelServiceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelServiceError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ModelServiceError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let json_resp: Value =
            serde_json::from_str(&body).map_err(|e| ModelServiceError::Decode(e.to_string()))?;
        parse_response(json_resp)
    }
}

/// Bounds each call by a timeout and retries transient failures.
pub struct Resilient<M> {
    inner: M,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<M: ModelService> Resilient<M> {
    pub fn new(inner: M, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            retry,
            timeout,
        }
    }
}

#[async_trait]
impl<M: ModelService> ModelService for Resilient<M> {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelServiceError> {
        let inner = &self.inner;
        let timeout = self.timeout;
        let outcome = self
            .retry
            .run("model call", || async move {
                match tokio::time::timeout(timeout, inner.respond(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelServiceError::Timeout(timeout)),
                }
            })
            .await;

        match outcome {
            Err(e) if e.is_transient() => Err(ModelServiceError::Exhausted {
                attempts: self.retry.max_attempts.max(1),
                last: Box::new(e),
            }),
            other => other,
        }
    }
}

fn tool_definition(catalog: &ActionCatalog, native: bool) -> Value {
    if native {
        json!({
            "type": NATIVE_TOOL_TYPE,
            "name": catalog.tool_name,
            "display_width_px": catalog.display.width,
            "display_height_px": catalog.display.height,
        })
    } else {
        json!({
            "name": catalog.tool_name,
            "description": format!(
                "Control the mouse and keyboard of a {}x{} screen and take screenshots.",
                catalog.display.width, catalog.display.height
            ),
            "input_schema": catalog.input_schema(),
        })
    }
}

/// Maps history to Messages API turns. Consecutive entries with the same
/// role are merged, so all tool results of one turn share a user message.
fn wire_messages(history: &[Message], keep_recent_images: usize) -> Vec<Value> {
    let total_images = history
        .iter()
        .filter(|m| matches!(m, Message::ToolResult { result, .. } if result.image.is_some()))
        .count();
    let mut to_omit = total_images.saturating_sub(keep_recent_images);

    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in history {
        let (role, blocks) = match message {
            Message::User { text } => ("user", vec![json!({"type": "text", "text": text})]),
            Message::Model { content } => (
                "assistant",
                content
                    .iter()
                    .filter(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()))
                    .filter_map(|b| serde_json::to_value(b).ok())
                    .collect(),
            ),
            Message::ToolResult {
                tool_use_id,
                result,
            } => {
                let omit = result.image.is_some() && to_omit > 0;
                if omit {
                    to_omit -= 1;
                }
                ("user", vec![tool_result_block(tool_use_id, result, omit)])
            }
        };
        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((last, existing)) if *last == role => existing.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    turns
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn tool_result_block(tool_use_id: &str, result: &ActionResult, omit_image: bool) -> Value {
    let mut content = Vec::new();
    if !result.output.is_empty() {
        content.push(json!({"type": "text", "text": result.output}));
    }
    if let Some(error) = &result.error {
        content.push(json!({"type": "text", "text": error}));
    }
    match &result.image {
        Some(_) if omit_image => content.push(json!({"type": "text", "text": OMITTED_IMAGE})),
        Some(image) => content.push(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.media_type,
                "data": image.data,
            },
        })),
        None => {}
    }
    if content.is_empty() {
        content.push(json!({"type": "text", "text": "done"}));
    }
    json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "content": content,
        "is_error": result.is_error(),
    })
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<Value>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

fn parse_response(json_resp: Value) -> Result<ModelResponse, ModelServiceError> {
    let wire: WireResponse =
        serde_json::from_value(json_resp).map_err(|e| ModelServiceError::Decode(e.to_string()))?;
    let content = wire
        .content
        .into_iter()
        .filter_map(|block| match serde_json::from_value::<ContentBlock>(block.clone()) {
            Ok(block) => Some(block),
            Err(_) => {
                warn!("[brain] ignoring unsupported content block: {}", block["type"]);
                None
            }
        })
        .collect();
    Ok(ModelResponse {
        content,
        usage: wire.usage,
        stop_reason: wire.stop_reason,
    })
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().chars().take(500).collect())
}

//! Anthropic Messages API model.
//!
//! Streaming is served from a single non-streaming request whose content is
//! replayed as stream parts, so the agent runtime sees the same event order
//! it would from a server-sent-event stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::chat::content::ContentBlock;
use crate::error::LlmError;
use crate::llm::{
    FinishReason, LanguageModel, Message, MessagePart, ModelCall, ModelResponse, PartStream, Role,
    StreamPart, ToolChoice, ToolOutput,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const PROVIDER: &str = "anthropic";

pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicModel {
    pub fn new(api_key: SecretString, model: &str) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            model: model.to_string(),
            base_url: API_URL.to_string(),
        })
    }

    /// Point the model at a different endpoint (proxies, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn request_body(&self, call: &ModelCall) -> Value {
        let (system, messages) = convert_prompt(&call.prompt);
        let mut body = json!({
            "model": self.model,
            "max_tokens": call.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !call.tools.is_empty() && call.tool_choice != ToolChoice::None {
            let tools: Vec<Value> = call
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ApiContent>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

fn convert_part(part: &MessagePart) -> Option<Value> {
    match part {
        MessagePart::Text { text } if !text.is_empty() => Some(json!({"type": "text", "text": text})),
        MessagePart::Text { .. } | MessagePart::Reasoning { .. } => None,
        MessagePart::File { media_type, data } => {
            let kind = if media_type.starts_with("image/") {
                "image"
            } else {
                "document"
            };
            Some(json!({
                "type": kind,
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }))
        }
        MessagePart::ToolCall {
            tool_call_id,
            tool_name,
            input,
        } => Some(json!({
            "type": "tool_use",
            "id": tool_call_id,
            "name": tool_name,
            "input": serde_json::from_str::<Value>(input).unwrap_or_else(|_| json!({})),
        })),
        MessagePart::ToolResult {
            tool_call_id,
            output,
        } => {
            let (text, is_error) = match output {
                ToolOutput::Text(text) => (text, false),
                ToolOutput::Error(text) => (text, true),
            };
            Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": text,
                "is_error": is_error,
            }))
        }
    }
}

/// Split out system text and fold the rest into alternating API messages.
/// Tool messages become user messages, and adjacent same-role messages merge.
fn convert_prompt(prompt: &[Message]) -> (String, Vec<Value>) {
    let mut system = Vec::new();
    let mut out: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in prompt {
        let role = match message.role {
            Role::System => {
                for part in &message.content {
                    if let MessagePart::Text { text } = part {
                        system.push(text.clone());
                    }
                }
                continue;
            }
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };
        let blocks: Vec<Value> = message.content.iter().filter_map(convert_part).collect();
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => out.push((role, blocks)),
        }
    }

    let messages = out
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system.join("\n\n"), messages)
}

fn response_to_content(response: ApiResponse) -> ModelResponse {
    let content = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ApiContent::Text { text } => Some(ContentBlock::Text { text }),
            ApiContent::Thinking { thinking } => Some(ContentBlock::Reasoning { text: thinking }),
            ApiContent::ToolUse { id, name, input } => Some(ContentBlock::ToolCall {
                tool_call_id: id,
                tool_name: name,
                input: input.to_string(),
            }),
            ApiContent::Unknown => None,
        })
        .collect();
    ModelResponse {
        content,
        finish_reason: finish_reason(response.stop_reason.as_deref()),
    }
}

/// Replay a finished response as stream parts.
fn response_to_parts(response: ModelResponse) -> Vec<StreamPart> {
    let mut parts = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text } => parts.push(StreamPart::TextDelta(text)),
            ContentBlock::Reasoning { text } => parts.push(StreamPart::ReasoningDelta(text)),
            ContentBlock::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => {
                parts.push(StreamPart::ToolInputStart {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                });
                parts.push(StreamPart::ToolInputDelta {
                    id: tool_call_id.clone(),
                    delta: input.clone(),
                });
                parts.push(StreamPart::ToolCall {
                    id: tool_call_id,
                    name: tool_name,
                    input,
                });
            }
            _ => {}
        }
    }
    parts.push(StreamPart::Finish(response.finish_reason));
    parts
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, call: ModelCall) -> Result<ModelResponse, LlmError> {
        let body = self.request_body(&call);
        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        let parsed: ApiResponse = resp.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        Ok(response_to_content(parsed))
    }

    async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError> {
        let response = self.generate(call).await?;
        let parts = response_to_parts(response);
        Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
    }
}

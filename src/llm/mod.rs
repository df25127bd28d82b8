//! LLM integration for chatd.
//!
//! Provider-agnostic prompt types, the [`LanguageModel`] trait the agent
//! runtime drives, and model resolution from a chat's `model_config`.
//!
//! Supports:
//! - **Anthropic**: Messages API over `reqwest`

pub mod anthropic;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::chat::content::{ContentBlock, ToolResultBlock};
use crate::chat::model::Chat;
use crate::error::LlmError;

pub use anthropic::AnthropicModel;

/// Role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Output of a tool as presented to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Error(String),
}

/// One part of a prompt message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    File { media_type: String, data: String },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: String,
    },
    ToolResult {
        tool_call_id: String,
        output: ToolOutput,
    },
}

/// A provider-agnostic prompt message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<MessagePart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![MessagePart::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![MessagePart::Text { text: text.into() }],
        }
    }

    /// `(tool_call_id, tool_name)` of every tool call in this message.
    pub fn tool_calls(&self) -> Vec<(&str, &str)> {
        self.content
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolCall {
                    tool_call_id,
                    tool_name,
                    ..
                } => Some((tool_call_id.as_str(), tool_name.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Text of this message if it is exactly one text part.
    pub fn single_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [MessagePart::Text { text }] => Some(text),
            _ => None,
        }
    }
}

/// Convert persisted content blocks into prompt parts.
///
/// Sources have no prompt representation and are skipped.
pub fn content_to_message_parts(blocks: &[ContentBlock]) -> Vec<MessagePart> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(MessagePart::Text { text: text.clone() }),
            ContentBlock::Reasoning { text } => Some(MessagePart::Reasoning { text: text.clone() }),
            ContentBlock::File { media_type, data } => Some(MessagePart::File {
                media_type: media_type.clone(),
                data: data.clone(),
            }),
            ContentBlock::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => Some(MessagePart::ToolCall {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
            }),
            ContentBlock::ToolResult(result) => Some(tool_result_to_part(result)),
            ContentBlock::Source { .. } => None,
        })
        .collect()
}

/// The prompt part for a tool result.
pub fn tool_result_to_part(result: &ToolResultBlock) -> MessagePart {
    let text = result.output_text();
    MessagePart::ToolResult {
        tool_call_id: result.tool_call_id.clone(),
        output: if result.is_error {
            ToolOutput::Error(text)
        } else {
            ToolOutput::Text(text)
        },
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Whether the model may call tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
}

/// A single model invocation.
#[derive(Debug, Clone, Default)]
pub struct ModelCall {
    pub prompt: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_output_tokens: Option<u32>,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other,
}

/// Result of a non-streaming call.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
}

/// An event in a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    TextDelta(String),
    ReasoningDelta(String),
    ToolInputStart { id: String, name: String },
    ToolInputDelta { id: String, delta: String },
    /// A complete tool call. Input is the raw JSON argument text.
    ToolCall { id: String, name: String, input: String },
    Source { id: String, url: String, title: String },
    Finish(FinishReason),
}

pub type PartStream = BoxStream<'static, Result<StreamPart, LlmError>>;

/// A chat-capable language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name, e.g. `anthropic`.
    fn provider(&self) -> &str;

    /// Model identifier.
    fn model(&self) -> &str;

    /// Run a call to completion.
    async fn generate(&self, call: ModelCall) -> Result<ModelResponse, LlmError>;

    /// Run a call and stream its parts.
    async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError>;
}

/// Maps a chat to the model that should drive it.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, chat: &Chat) -> Result<Arc<dyn LanguageModel>, LlmError>;
}

/// Resolver that always returns the same model.
pub struct FixedModelResolver(pub Arc<dyn LanguageModel>);

impl ModelResolver for FixedModelResolver {
    fn resolve(&self, _chat: &Chat) -> Result<Arc<dyn LanguageModel>, LlmError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
}

/// Configuration for creating a language model.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create a language model from configuration.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => {
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(AnthropicModel::new(
                config.api_key.clone(),
                &config.model,
            )?))
        }
    }
}

/// Chat model selection as stored in `chats.model_config`.
#[derive(Debug, Clone, Default, Deserialize)]
struct ChatModelConfig {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Resolves chats to models built from provider keys, honoring each chat's
/// `model_config` and falling back to the default model.
pub struct ConfigModelResolver {
    api_key: secrecy::SecretString,
    default_model: String,
}

impl ConfigModelResolver {
    pub fn new(api_key: secrecy::SecretString, default_model: impl Into<String>) -> Self {
        Self {
            api_key,
            default_model: default_model.into(),
        }
    }
}

impl ModelResolver for ConfigModelResolver {
    fn resolve(&self, chat: &Chat) -> Result<Arc<dyn LanguageModel>, LlmError> {
        let config: ChatModelConfig = if chat.model_config.is_null() {
            ChatModelConfig::default()
        } else {
            serde_json::from_value(chat.model_config.clone())?
        };

        match config.provider.as_deref().map(str::trim) {
            None | Some("") | Some("anthropic") => {}
            Some(other) => {
                return Err(LlmError::UnsupportedModel(format!(
                    "provider {other:?} is not supported"
                )));
            }
        }

        let model = config
            .model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        create_model(&LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: self.api_key.clone(),
            model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::model::{ChatStatus, NewChat};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn chat_with_config(config: serde_json::Value) -> Chat {
        let new = NewChat::new(Uuid::new_v4(), "t").with_model_config(config);
        Chat {
            id: new.id,
            owner_id: new.owner_id,
            title: new.title,
            status: ChatStatus::Pending,
            worker_id: None,
            started_at: None,
            parent_chat_id: None,
            root_chat_id: None,
            task_status: None,
            task_report: None,
            workspace_id: None,
            workspace_agent_id: None,
            model_config: new.model_config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_model_constructs_without_network() {
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-3-5-sonnet-latest".to_string(),
        };
        let model = create_model(&config).unwrap();
        assert_eq!(model.provider(), "anthropic");
        assert_eq!(model.model(), "claude-3-5-sonnet-latest");
    }

    #[test]
    fn resolver_prefers_chat_model_over_default() {
        let resolver = ConfigModelResolver::new("k".to_string().into(), "default-model");
        let model = resolver
            .resolve(&chat_with_config(json!({"model": "claude-opus"})))
            .unwrap();
        assert_eq!(model.model(), "claude-opus");

        let model = resolver.resolve(&chat_with_config(json!({}))).unwrap();
        assert_eq!(model.model(), "default-model");
    }

    #[test]
    fn resolver_rejects_unknown_provider() {
        let resolver = ConfigModelResolver::new("k".to_string().into(), "default-model");
        let err = resolver
            .resolve(&chat_with_config(json!({"provider": "openai"})))
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::UnsupportedModel(_)));
    }

    #[test]
    fn single_text_only_matches_one_text_part() {
        assert_eq!(Message::user("hi").single_text(), Some("hi"));
        let mixed = Message {
            role: Role::User,
            content: vec![
                MessagePart::Text { text: "a".into() },
                MessagePart::Text { text: "b".into() },
            ],
        };
        assert_eq!(mixed.single_text(), None);
    }
}

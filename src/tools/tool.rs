//! Tool trait and the per-run context tools execute in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chat::content::ToolResultBlock;
use crate::chat::model::Chat;
use crate::llm::LanguageModel;
use crate::store::ChatStore;
use crate::stream::StreamManager;
use crate::subagent::SubagentService;
use crate::tools::workspace::{AgentConnector, WorkspaceConnCell, WorkspaceCreator};

/// A tool call as emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub input: String,
}

impl ToolCall {
    /// An empty, successful result for this call.
    pub fn result(&self) -> ToolResultBlock {
        ToolResultBlock::base(&self.id, &self.name)
    }
}

/// Errors a tool raises before it has a payload to report.
///
/// Every variant becomes an `is_error` result, never a failed run.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidParameters(String),

    #[error("{0}")]
    ExecutionFailed(String),
}

impl From<crate::error::WorkspaceError> for ToolError {
    fn from(e: crate::error::WorkspaceError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<crate::error::SubagentError> for ToolError {
    fn from(e: crate::error::SubagentError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<crate::error::DatabaseError> for ToolError {
    fn from(e: crate::error::DatabaseError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

/// Decode a tool call's arguments. Empty input decodes as `{}`.
pub fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    let input = call.input.trim();
    let input = if input.is_empty() { "{}" } else { input };
    serde_json::from_str(input).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

/// Require a non-blank string argument.
pub fn require_str<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str, ToolError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ToolError::InvalidParameters(message.to_string())),
    }
}

/// Parse a chat id argument.
pub fn parse_chat_id(value: &str) -> Result<Uuid, ToolError> {
    Uuid::parse_str(value.trim()).map_err(|_| ToolError::InvalidParameters("invalid chat_id".into()))
}

/// Everything a tool may touch during one chat run.
pub struct ToolContext {
    pub chat_id: Uuid,
    /// Current chat state. Tools that change the chat update it in place.
    pub chat: Arc<Mutex<Chat>>,
    pub model: Arc<dyn LanguageModel>,
    pub store: Arc<dyn ChatStore>,
    pub streams: StreamManager,
    pub subagents: Arc<SubagentService>,
    pub connections: Arc<WorkspaceConnCell>,
    pub agent_connector: Option<Arc<dyn AgentConnector>>,
    pub workspace_creator: Option<Arc<dyn WorkspaceCreator>>,
    pub execute_timeout: Duration,
    pub subagent_await_timeout: Duration,
}

impl ToolContext {
    pub async fn chat_snapshot(&self) -> Chat {
        self.chat.lock().await.clone()
    }
}

/// A capability exposed to the model.
///
/// `execute` never fails: problems are reported as error results so the
/// model can react.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock;
}

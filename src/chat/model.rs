//! Chat, message and workspace records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a chat job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    /// Queued, waiting for a worker to claim it.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Idle until the user (or a delegated child) wakes it up.
    Waiting,
    Completed,
    /// The last run failed.
    Error,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether a new request should flip the chat back to pending.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Waiting | Self::Completed)
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown chat status {other:?}")),
        }
    }
}

/// Delegation state of a child chat. Unset on top-level chats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingReport,
    Reported,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingReport => "awaiting_report",
            Self::Reported => "reported",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_report" => Ok(Self::AwaitingReport),
            "reported" => Ok(Self::Reported),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

/// A durable chat job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub status: ChatStatus,
    pub worker_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub parent_chat_id: Option<Uuid>,
    pub root_chat_id: Option<Uuid>,
    pub task_status: Option<TaskStatus>,
    pub task_report: Option<String>,
    pub workspace_id: Option<Uuid>,
    pub workspace_agent_id: Option<Uuid>,
    /// Opaque model selection, e.g. `{"provider": "anthropic", "model": "..."}`.
    pub model_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a chat.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub status: ChatStatus,
    pub parent_chat_id: Option<Uuid>,
    pub root_chat_id: Option<Uuid>,
    pub task_status: Option<TaskStatus>,
    pub workspace_id: Option<Uuid>,
    pub workspace_agent_id: Option<Uuid>,
    pub model_config: serde_json::Value,
}

impl NewChat {
    /// A top-level chat owned by `owner_id`, created in `Waiting`.
    pub fn new(owner_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title: title.into(),
            status: ChatStatus::Waiting,
            parent_chat_id: None,
            root_chat_id: None,
            task_status: None,
            workspace_id: None,
            workspace_agent_id: None,
            model_config: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_status(mut self, status: ChatStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_model_config(mut self, config: serde_json::Value) -> Self {
        self.model_config = config;
        self
    }

    pub fn with_workspace(mut self, workspace_id: Uuid, agent_id: Option<Uuid>) -> Self {
        self.workspace_id = Some(workspace_id);
        self.workspace_agent_id = agent_id;
        self
    }
}

/// Role of a persisted chat message.
///
/// The two marker roles are internal delegation bookkeeping and never reach
/// the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageRole {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "tool")]
    Tool,
    #[serde(rename = "__subagent_response_marker")]
    SubagentResponseMarker,
    #[serde(rename = "__subagent_report_only_marker")]
    SubagentReportOnlyMarker,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::SubagentResponseMarker => "__subagent_response_marker",
            Self::SubagentReportOnlyMarker => "__subagent_report_only_marker",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "__subagent_response_marker" => Ok(Self::SubagentResponseMarker),
            "__subagent_report_only_marker" => Ok(Self::SubagentReportOnlyMarker),
            other => Err(format!("unknown message role {other:?}")),
        }
    }
}

/// Which half of a delegation exchange a message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentEvent {
    Request,
    Response,
}

impl SubagentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl FromStr for SubagentEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            other => Err(format!("unknown subagent event {other:?}")),
        }
    }
}

/// A persisted, append-only chat message. `id` orders messages within a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub chat_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub role: MessageRole,
    pub content: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub hidden: bool,
    pub subagent_request_id: Option<Uuid>,
    pub subagent_event: Option<SubagentEvent>,
}

/// Parameters for appending a chat message.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub content: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub hidden: bool,
    pub subagent_request_id: Option<Uuid>,
    pub subagent_event: Option<SubagentEvent>,
}

impl NewChatMessage {
    pub fn new(chat_id: Uuid, role: MessageRole, content: serde_json::Value) -> Self {
        Self {
            chat_id,
            role,
            content: Some(content),
            tool_call_id: None,
            hidden: false,
            subagent_request_id: None,
            subagent_event: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn with_subagent(mut self, request_id: Uuid, event: Option<SubagentEvent>) -> Self {
        self.subagent_request_id = Some(request_id);
        self.subagent_event = event;
        self
    }
}

/// Externally owned workspace state, as far as this core reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub deleted: bool,
}

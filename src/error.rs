//! Error types for chatd.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the chat daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Subagent(#[from] SubagentError),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn chat_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "chat".to_string(),
            id: id.to_string(),
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Unsupported model configuration: {0}")]
    UnsupportedModel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while talking to a workspace or its agent.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace agent connector is not configured")]
    ConnectorNotConfigured,

    #[error("workspace creator is not configured")]
    CreatorNotConfigured,

    #[error("chat has no workspace agent")]
    NoWorkspace,

    #[error("no workspace agents available")]
    NoAgents,

    #[error("connect to workspace agent {agent_id}: {reason}")]
    ConnectFailed { agent_id: Uuid, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Delegation (subagent) errors.
///
/// `NotDescendant` is matched by callers, keep it distinct.
#[derive(Debug, thiserror::Error)]
pub enum SubagentError {
    #[error("target chat is not a descendant of current chat")]
    NotDescendant,

    #[error("prompt is required")]
    PromptRequired,

    #[error("message is required")]
    MessageRequired,

    #[error("no pending subagent request found")]
    NoPendingRequest,

    #[error("timed out waiting for delegated subagent report")]
    Timeout,

    #[error("chat {0} not found")]
    ChatNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors that end a single chat run.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat interrupted")]
    Interrupted,

    #[error("processor is shutting down")]
    Shutdown,

    #[error("chat exceeded {0} tool steps")]
    StepLimit(usize),

    #[error("chat processing panicked: {0}")]
    Panicked(String),

    #[error("unsupported chat message role {0:?}")]
    UnsupportedRole(String),

    #[error("decode chat message {id}: {reason}")]
    InvalidMessage { id: i64, reason: String },

    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Subagent(#[from] SubagentError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

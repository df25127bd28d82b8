//! Workspace-bound tools and the remote agent transport they use.
//!
//! `read_file`, `write_file`, `edit_files` and `execute` all share one lazily
//! resolved connection per chat run, held in a [`WorkspaceConnCell`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::chat::content::ToolResultBlock;
use crate::chat::model::Chat;
use crate::error::WorkspaceError;
use crate::llm::LanguageModel;
use crate::store::ChatStore;
use crate::tools::tool::{Tool, ToolCall, ToolContext, ToolError, parse_args, require_str};

// ── Transport ───────────────────────────────────────────────────────

/// One search-and-replace edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub search: String,
    pub replace: String,
}

/// Edits for one file, applied together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdits {
    pub path: String,
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

/// Captured output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Interleaved stdout and stderr.
    pub output: String,
    pub exit_status: i32,
}

/// A shell session on the workspace agent.
#[async_trait]
pub trait CommandSession: Send + Sync {
    /// Run `command` to completion.
    async fn combined_output(&self, command: &str) -> Result<CommandOutput, WorkspaceError>;
}

/// Connection to a running workspace agent.
///
/// Dropping the last handle releases the connection.
#[async_trait]
pub trait AgentConn: Send + Sync {
    /// Read a file. Returns its bytes and MIME type.
    async fn read_file(
        &self,
        path: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<u8>, String), WorkspaceError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError>;

    async fn edit_files(&self, files: &[FileEdits]) -> Result<(), WorkspaceError>;

    /// Open a session for running commands.
    async fn command_session(&self) -> Result<Box<dyn CommandSession>, WorkspaceError>;
}

/// Dials workspace agents.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, agent_id: Uuid) -> Result<Arc<dyn AgentConn>, WorkspaceError>;
}

// ── Provisioning ────────────────────────────────────────────────────

/// One chunk of provisioning output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLog {
    pub stage: String,
    pub level: String,
    pub output: String,
}

pub type BuildLogHandler = Arc<dyn Fn(BuildLog) + Send + Sync>;

/// Input to a [`WorkspaceCreator`].
pub struct CreateWorkspaceRequest {
    pub chat: Chat,
    pub model: Arc<dyn LanguageModel>,
    pub prompt: String,
    /// Raw workspace request as given by the model.
    pub spec: serde_json::Value,
    pub build_log: Option<BuildLogHandler>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateWorkspaceResult {
    pub created: bool,
    pub workspace_id: Option<Uuid>,
    pub workspace_agent_id: Option<Uuid>,
    pub workspace_name: String,
    pub workspace_url: String,
    pub reason: String,
}

/// Provisions workspaces on behalf of a chat.
#[async_trait]
pub trait WorkspaceCreator: Send + Sync {
    async fn create_workspace(
        &self,
        request: CreateWorkspaceRequest,
    ) -> Result<CreateWorkspaceResult, WorkspaceError>;
}

// ── Shared connection ───────────────────────────────────────────────

/// Resolve-once holder for the run's workspace connection.
///
/// Dialing happens outside the lock. When two callers race, the first to
/// publish wins and the other drops its connection.
#[derive(Default)]
pub struct WorkspaceConnCell {
    conn: Mutex<Option<Arc<dyn AgentConn>>>,
}

impl WorkspaceConnCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn AgentConn>> {
        self.conn.lock().expect("workspace connection poisoned").clone()
    }

    /// Return the shared connection, dialing it on first use.
    pub async fn get_or_connect(
        &self,
        chat: &Chat,
        store: &dyn ChatStore,
        connector: Option<&Arc<dyn AgentConnector>>,
    ) -> Result<Arc<dyn AgentConn>, WorkspaceError> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let connector = connector.ok_or(WorkspaceError::ConnectorNotConfigured)?;
        let agent_id = resolve_agent_id(chat, store).await?;
        let dialed = connector.connect(agent_id).await.map_err(|e| {
            WorkspaceError::ConnectFailed {
                agent_id,
                reason: e.to_string(),
            }
        })?;

        let mut slot = self.conn.lock().expect("workspace connection poisoned");
        match slot.as_ref() {
            Some(existing) => {
                debug!(agent_id = %agent_id, "Discarding duplicate workspace connection");
                Ok(Arc::clone(existing))
            }
            None => {
                *slot = Some(Arc::clone(&dialed));
                Ok(dialed)
            }
        }
    }
}

/// The agent a chat's workspace tools talk to.
///
/// An explicit agent wins; otherwise the workspace's first agent.
pub async fn resolve_agent_id(chat: &Chat, store: &dyn ChatStore) -> Result<Uuid, WorkspaceError> {
    if let Some(agent_id) = chat.workspace_agent_id {
        return Ok(agent_id);
    }
    let workspace_id = chat.workspace_id.ok_or(WorkspaceError::NoWorkspace)?;
    let agents = store.get_workspace_agents(workspace_id).await?;
    agents.first().copied().ok_or(WorkspaceError::NoAgents)
}

async fn workspace_conn(ctx: &ToolContext) -> Result<Arc<dyn AgentConn>, ToolError> {
    let chat = ctx.chat_snapshot().await;
    Ok(ctx
        .connections
        .get_or_connect(&chat, ctx.store.as_ref(), ctx.agent_connector.as_ref())
        .await?)
}

// ── read_file ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

/// Read a file from the workspace.
#[derive(Debug, Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to read"},
                "offset": {"type": "integer", "description": "Byte offset to start reading from"},
                "limit": {"type": "integer", "description": "Maximum number of bytes to read"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        let base = call.result();
        let run = async {
            let args: ReadFileArgs = parse_args(call)?;
            let conn = workspace_conn(ctx).await?;
            let path = require_str(args.path.as_deref(), "path is required")?;
            let (data, mime_type) = conn
                .read_file(path, args.offset.unwrap_or(0), args.limit.unwrap_or(0))
                .await?;
            Ok::<_, ToolError>(json!({
                "content": String::from_utf8_lossy(&data),
                "mime_type": mime_type,
            }))
        };
        match run.await {
            Ok(payload) => base.with_result(payload),
            Err(e) => base.error(e),
        }
    }
}

// ── write_file ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: String,
}

/// Write a file to the workspace.
#[derive(Debug, Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file to the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to write"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        let base = call.result();
        let run = async {
            let args: WriteFileArgs = parse_args(call)?;
            let conn = workspace_conn(ctx).await?;
            let path = require_str(args.path.as_deref(), "path is required")?;
            conn.write_file(path, args.content.as_bytes()).await?;
            Ok::<_, ToolError>(json!({"ok": true}))
        };
        match run.await {
            Ok(payload) => base.with_result(payload),
            Err(e) => base.error(e),
        }
    }
}

// ── edit_files ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EditFilesArgs {
    #[serde(default)]
    files: Vec<FileEdits>,
}

/// Search-and-replace edits across workspace files.
#[derive(Debug, Default)]
pub struct EditFilesTool;

#[async_trait]
impl Tool for EditFilesTool {
    fn name(&self) -> &str {
        "edit_files"
    }

    fn description(&self) -> &str {
        "Perform search-and-replace edits on one or more files in the workspace. \
         Each file can have multiple edits applied atomically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "edits": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "search": {"type": "string"},
                                        "replace": {"type": "string"}
                                    },
                                    "required": ["search", "replace"]
                                }
                            }
                        },
                        "required": ["path", "edits"]
                    }
                }
            },
            "required": ["files"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        let base = call.result();
        let run = async {
            let args: EditFilesArgs = parse_args(call)?;
            let conn = workspace_conn(ctx).await?;
            if args.files.is_empty() {
                return Err(ToolError::InvalidParameters("files is required".into()));
            }
            conn.edit_files(&args.files).await?;
            Ok(json!({"ok": true}))
        };
        match run.await {
            Ok(payload) => base.with_result(payload),
            Err(e) => base.error(e),
        }
    }
}

// ── execute ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExecuteArgs {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Run a shell command in the workspace.
#[derive(Debug, Default)]
pub struct ExecuteTool;

/// Run `command` on `conn` within `timeout`.
///
/// Returns the output, the exit code and an error message. A nonzero exit
/// status is an error carrying that code; transport failures report exit
/// code 1; a timeout reports exit code 0 with a deadline error.
pub async fn run_command(
    conn: &dyn AgentConn,
    command: &str,
    timeout: Duration,
) -> (String, i32, Option<String>) {
    let run = async {
        let session = conn.command_session().await.map_err(|e| (0, e.to_string()))?;
        session
            .combined_output(command)
            .await
            .map_err(|e| (1, e.to_string()))
    };

    match tokio::time::timeout(timeout, run).await {
        Err(elapsed) => (String::new(), 0, Some(elapsed.to_string())),
        Ok(Err((code, message))) => (String::new(), code, Some(message)),
        Ok(Ok(out)) if out.exit_status != 0 => {
            let message = format!("Process exited with status {}", out.exit_status);
            (out.output, out.exit_status, Some(message))
        }
        Ok(Ok(out)) => (out.output, 0, None),
    }
}

#[async_trait]
impl Tool for ExecuteTool {
    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run"},
                "timeout_seconds": {"type": "integer", "description": "Timeout in seconds (default 60)"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        let mut result = call.result();
        let prepared = async {
            let args: ExecuteArgs = parse_args(call)?;
            let conn = workspace_conn(ctx).await?;
            let command = require_str(args.command.as_deref(), "command is required")?.to_string();
            Ok::<_, ToolError>((conn, command, args.timeout_seconds))
        };
        let (conn, command, timeout_seconds) = match prepared.await {
            Ok(prepared) => prepared,
            Err(e) => return result.error(e),
        };

        let timeout = timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(ctx.execute_timeout);
        let (output, exit_code, error) = run_command(conn.as_ref(), &command, timeout).await;

        let mut payload = json!({
            "output": output,
            "exit_code": exit_code,
        });
        if let Some(error) = error {
            payload["error"] = json!(error);
            result.is_error = true;
        }
        result.with_result(payload)
    }
}

//! `create_workspace`: provision a workspace through the external creator and
//! stream its build logs back to subscribers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::content::ToolResultBlock;
use crate::chat::model::{MessageRole, Workspace};
use crate::error::WorkspaceError;
use crate::stream::{MessagePart, StreamEvent, StreamManager};
use crate::tools::tool::{Tool, ToolCall, ToolContext, ToolError, parse_args};
use crate::tools::workspace::{BuildLog, CreateWorkspaceRequest, CreateWorkspaceResult};

const MAX_BUILD_LOG_LINES: usize = 120;
const MAX_BUILD_LOG_CHARS: usize = 16 * 1024;
const MAX_BUILD_LOG_LINE_CHARS: usize = 240;

const BUILD_LOG_HEADER: &str = "\n[workspace build logs]\n";
const BUILD_LOG_TRUNCATED: &str = "[workspace build logs truncated]\n";

// ── Build log emitter ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct EmitterState {
    line_count: usize,
    char_count: usize,
    started: bool,
    truncated: bool,
}

/// Publishes provisioning output as bounded `tool_result` deltas.
pub struct BuildLogEmitter {
    streams: StreamManager,
    chat_id: Uuid,
    tool_call_id: String,
    tool_name: String,
    state: Mutex<EmitterState>,
}

impl BuildLogEmitter {
    pub fn new(streams: StreamManager, chat_id: Uuid, tool_call_id: &str, tool_name: &str) -> Self {
        Self {
            streams,
            chat_id,
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            state: Mutex::new(EmitterState::default()),
        }
    }

    pub fn emit(&self, entry: &BuildLog) {
        let mut state = self.state.lock().expect("build log emitter poisoned");
        if state.truncated {
            return;
        }

        let output = entry.output.replace("\r\n", "\n").replace('\r', "\n");
        let prefix = build_log_prefix(entry);
        for line in output.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            self.emit_line(&mut state, &format!("{prefix}{line}"));
            if state.truncated {
                return;
            }
        }
    }

    fn emit_line(&self, state: &mut EmitterState, line: &str) {
        if !state.started {
            self.publish_delta(BUILD_LOG_HEADER);
            state.started = true;
        }

        let line: String = line.chars().take(MAX_BUILD_LOG_LINE_CHARS).collect();
        if line.is_empty() {
            return;
        }

        let delta = format!("{line}\n");
        if state.line_count >= MAX_BUILD_LOG_LINES
            || state.char_count + delta.len() > MAX_BUILD_LOG_CHARS
        {
            self.publish_delta(BUILD_LOG_TRUNCATED);
            state.truncated = true;
            return;
        }

        self.publish_delta(&delta);
        state.line_count += 1;
        state.char_count += delta.len();
    }

    fn publish_delta(&self, delta: &str) {
        if delta.trim().is_empty() {
            return;
        }
        self.streams.publish(
            self.chat_id,
            StreamEvent::message_part(
                self.chat_id,
                MessageRole::Tool,
                MessagePart::tool_result_delta(&self.tool_call_id, &self.tool_name, delta),
            ),
        );
    }
}

/// `[build/<stage>/<level>] ` with empty segments left out.
fn build_log_prefix(entry: &BuildLog) -> String {
    let segments: Vec<&str> = ["build", entry.stage.trim(), entry.level.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    format!("[{}] ", segments.join("/"))
}

// ── Tool ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateWorkspaceArgs {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    workspace: Option<Value>,
    #[serde(default)]
    request: Option<Value>,
}

/// Create a workspace for the chat.
#[derive(Debug, Default)]
pub struct CreateWorkspaceTool;

/// The tool payload for a creator result.
fn result_payload(result: &mut CreateWorkspaceResult) -> Value {
    if !result.created && result.reason.trim().is_empty() {
        result.reason = "workspace was not created".to_string();
    }

    let mut payload = json!({
        "success": result.created,
        "created": result.created,
    });
    if let Some(id) = result.workspace_id.filter(|id| !id.is_nil()) {
        payload["workspace_id"] = json!(id.to_string());
    }
    if let Some(id) = result.workspace_agent_id.filter(|id| !id.is_nil()) {
        payload["workspace_agent_id"] = json!(id.to_string());
    }
    if !result.workspace_name.is_empty() {
        payload["workspace_name"] = json!(result.workspace_name);
    }
    if !result.workspace_url.is_empty() {
        payload["workspace_url"] = json!(result.workspace_url);
    }
    if !result.reason.is_empty() {
        payload["reason"] = json!(result.reason);
    }
    payload
}

impl CreateWorkspaceTool {
    async fn create(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<(Value, CreateWorkspaceResult), ToolError> {
        let creator = ctx
            .workspace_creator
            .as_ref()
            .ok_or(WorkspaceError::CreatorNotConfigured)?;
        let args: CreateWorkspaceArgs = parse_args(call)?;

        let spec = match [args.workspace, args.request].into_iter().flatten().find(|v| !v.is_null()) {
            Some(spec) => spec,
            None => serde_json::from_str(&call.input).unwrap_or(Value::Null),
        };

        let emitter = Arc::new(BuildLogEmitter::new(
            ctx.streams.clone(),
            ctx.chat_id,
            &call.id,
            &call.name,
        ));
        let request = CreateWorkspaceRequest {
            chat: ctx.chat_snapshot().await,
            model: Arc::clone(&ctx.model),
            prompt: args.prompt.unwrap_or_default().trim().to_string(),
            spec,
            build_log: Some(Arc::new(move |entry: BuildLog| emitter.emit(&entry))),
        };

        let mut result = creator.create_workspace(request).await?;
        let payload = result_payload(&mut result);
        Ok((payload, result))
    }

    /// Record the new workspace and link it to the chat.
    async fn persist(&self, ctx: &ToolContext, result: &CreateWorkspaceResult) -> Result<(), ToolError> {
        let Some(workspace_id) = result.workspace_id.filter(|id| !id.is_nil()) else {
            return Err(ToolError::ExecutionFailed(
                "workspace creator returned a created workspace without an ID".into(),
            ));
        };
        let agent_id = result.workspace_agent_id.filter(|id| !id.is_nil());

        let workspace = Workspace {
            id: workspace_id,
            name: result.workspace_name.clone(),
            deleted: false,
        };
        let agents: Vec<Uuid> = agent_id.into_iter().collect();
        ctx.store.upsert_workspace(&workspace, &agents).await?;

        let updated = ctx
            .store
            .update_chat_workspace(ctx.chat_id, Some(workspace_id), agent_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("update chat workspace: {e}")))?;
        *ctx.chat.lock().await = updated;

        info!(chat_id = %ctx.chat_id, workspace_id = %workspace_id, "Linked workspace to chat");
        Ok(())
    }
}

#[async_trait]
impl Tool for CreateWorkspaceTool {
    fn name(&self) -> &str {
        "create_workspace"
    }

    fn description(&self) -> &str {
        "Create a workspace when no workspace is selected, or when you need a different \
         template. Accepts a natural-language prompt and/or a workspace request object."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Natural-language description of the workspace"},
                "workspace": {"type": "object", "description": "Workspace request object"},
                "request": {"type": "object", "description": "Alias of workspace"}
            }
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        let base = call.result();
        let (payload, result) = match self.create(call, ctx).await {
            Ok(created) => created,
            Err(e) => {
                warn!(chat_id = %ctx.chat_id, error = %e, "create_workspace failed");
                return base.error(e);
            }
        };

        if result.created {
            if let Err(e) = self.persist(ctx, &result).await {
                return base.error(e);
            }
        }

        ToolResultBlock {
            is_error: !result.created,
            ..base.with_result(payload)
        }
    }
}

//! Delegation tools backed by [`SubagentService`](crate::subagent::SubagentService).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::chat::content::ToolResultBlock;
use crate::error::SubagentError;
use crate::subagent::{SUBAGENT_REPORT_TOOL, SubagentAwaitResult};
use crate::tools::tool::{Tool, ToolCall, ToolContext, ToolError, parse_args, parse_chat_id, require_str};

fn finish(call: &ToolCall, outcome: Result<Value, ToolError>) -> ToolResultBlock {
    match outcome {
        Ok(payload) => call.result().with_result(payload),
        Err(e) => call.result().error(e),
    }
}

fn parse_request_id(value: Option<&str>) -> Result<Option<Uuid>, ToolError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => Uuid::parse_str(v)
            .map(Some)
            .map_err(|_| ToolError::InvalidParameters("invalid request_id".into())),
    }
}

fn await_timeout(ctx: &ToolContext, timeout_seconds: Option<u64>) -> Duration {
    timeout_seconds
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(ctx.subagent_await_timeout)
}

fn completed_payload(chat_id: Uuid, title: &str, result: &SubagentAwaitResult) -> Value {
    json!({
        "chat_id": chat_id.to_string(),
        "request_id": result.request_id.to_string(),
        "title": title,
        "report": result.report,
        "status": "completed",
        "duration_ms": result.duration_ms,
    })
}

fn pending_payload(chat_id: Uuid, request_id: Uuid, title: &str) -> Value {
    json!({
        "chat_id": chat_id.to_string(),
        "request_id": request_id.to_string(),
        "title": title,
        "status": "pending",
    })
}

/// Await `request_id` on `target_id` and build the completed payload.
async fn await_payload(
    ctx: &ToolContext,
    target_id: Uuid,
    request_id: Uuid,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let result = ctx
        .subagents
        .await_report(ctx.chat_id, target_id, request_id, timeout)
        .await?;
    let title = ctx
        .store
        .get_chat_by_id(target_id)
        .await?
        .map(|c| c.title)
        .unwrap_or_default();
    Ok(completed_payload(target_id, &title, &result))
}

// ── subagent ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubagentArgs {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    background: Option<bool>,
}

/// Delegate work to a new child chat.
#[derive(Debug, Default)]
pub struct SubagentTool;

impl SubagentTool {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: SubagentArgs = parse_args(call)?;
        let parent = ctx.chat_snapshot().await;
        let (child, request_id) = ctx
            .subagents
            .create_child(&parent, args.prompt.as_deref().unwrap_or_default(), args.title.as_deref())
            .await?;

        if args.background.unwrap_or(true) {
            return Ok(pending_payload(child.id, request_id, &child.title));
        }
        await_payload(ctx, child.id, request_id, ctx.subagent_await_timeout).await
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "subagent"
    }

    fn description(&self) -> &str {
        "Delegate a task to a sub-agent running in its own chat. The sub-agent shares \
         this chat's workspace. Returns immediately unless background is false."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Task for the sub-agent"},
                "title": {"type": "string", "description": "Short title for the sub-agent chat"},
                "background": {"type": "boolean", "description": "Return without waiting for the report (default true)"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        finish(call, self.run(call, ctx).await)
    }
}

// ── subagent_await ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubagentAwaitArgs {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Wait for a sub-agent's report.
#[derive(Debug, Default)]
pub struct SubagentAwaitTool;

impl SubagentAwaitTool {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: SubagentAwaitArgs = parse_args(call)?;
        let target_id = parse_chat_id(require_str(args.chat_id.as_deref(), "chat_id is required")?)?;
        if !ctx.subagents.is_descendant(ctx.chat_id, target_id).await? {
            return Err(SubagentError::NotDescendant.into());
        }

        let request_id = match parse_request_id(args.request_id.as_deref())? {
            Some(id) => id,
            None => ctx
                .subagents
                .latest_pending_request_id(target_id)
                .await?
                .ok_or(SubagentError::NoPendingRequest)?,
        };
        await_payload(ctx, target_id, request_id, await_timeout(ctx, args.timeout_seconds)).await
    }
}

#[async_trait]
impl Tool for SubagentAwaitTool {
    fn name(&self) -> &str {
        "subagent_await"
    }

    fn description(&self) -> &str {
        "Wait for a sub-agent to report back. Without request_id the sub-agent's latest \
         outstanding request is awaited."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chat_id": {"type": "string", "description": "Sub-agent chat ID"},
                "request_id": {"type": "string", "description": "Request to await"},
                "timeout_seconds": {"type": "integer", "description": "How long to wait (default 300)"}
            },
            "required": ["chat_id"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        finish(call, self.run(call, ctx).await)
    }
}

// ── subagent_message ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubagentMessageArgs {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "await")]
    wait: bool,
}

/// Send a follow-up request to a sub-agent.
#[derive(Debug, Default)]
pub struct SubagentMessageTool;

impl SubagentMessageTool {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: SubagentMessageArgs = parse_args(call)?;
        let target_id = parse_chat_id(require_str(args.chat_id.as_deref(), "chat_id is required")?)?;
        let (target, request_id) = ctx
            .subagents
            .send_message(ctx.chat_id, target_id, args.message.as_deref().unwrap_or_default())
            .await?;

        if !args.wait {
            return Ok(pending_payload(target.id, request_id, &target.title));
        }
        await_payload(ctx, target.id, request_id, ctx.subagent_await_timeout).await
    }
}

#[async_trait]
impl Tool for SubagentMessageTool {
    fn name(&self) -> &str {
        "subagent_message"
    }

    fn description(&self) -> &str {
        "Send a follow-up message to an existing sub-agent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chat_id": {"type": "string", "description": "Sub-agent chat ID"},
                "message": {"type": "string", "description": "Follow-up request"},
                "await": {"type": "boolean", "description": "Wait for the report before returning"}
            },
            "required": ["chat_id", "message"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        finish(call, self.run(call, ctx).await)
    }
}

// ── subagent_report ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubagentReportArgs {
    #[serde(default)]
    report: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Report the outcome of delegated work to the parent chat.
#[derive(Debug, Default)]
pub struct SubagentReportTool;

impl SubagentReportTool {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: SubagentReportArgs = parse_args(call)?;
        let report = require_str(args.report.as_deref(), "report is required")?;
        let request_id = parse_request_id(args.request_id.as_deref())?;

        let result = ctx
            .subagents
            .mark_reported(ctx.chat_id, report, request_id)
            .await?;
        Ok(json!({
            "chat_id": ctx.chat_id.to_string(),
            "request_id": result.request_id.to_string(),
            "report": result.report,
            "status": "reported",
            "duration_ms": result.duration_ms,
        }))
    }
}

#[async_trait]
impl Tool for SubagentReportTool {
    fn name(&self) -> &str {
        SUBAGENT_REPORT_TOOL
    }

    fn description(&self) -> &str {
        "Report the outcome of your delegated task back to the parent agent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "report": {"type": "string", "description": "Concise summary of the outcome"},
                "request_id": {"type": "string", "description": "Request being answered"}
            },
            "required": ["report"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        finish(call, self.run(call, ctx).await)
    }
}

// ── subagent_terminate ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubagentTerminateArgs {
    #[serde(default)]
    chat_id: Option<String>,
}

/// Stop a sub-agent and everything it delegated.
#[derive(Debug, Default)]
pub struct SubagentTerminateTool;

impl SubagentTerminateTool {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: SubagentTerminateArgs = parse_args(call)?;
        let target_id = parse_chat_id(require_str(args.chat_id.as_deref(), "chat_id is required")?)?;
        ctx.subagents.terminate_subtree(ctx.chat_id, target_id).await?;

        let title = ctx
            .store
            .get_chat_by_id(target_id)
            .await?
            .map(|c| c.title)
            .unwrap_or_default();
        Ok(json!({
            "chat_id": target_id.to_string(),
            "title": title,
            "status": "terminated",
        }))
    }
}

#[async_trait]
impl Tool for SubagentTerminateTool {
    fn name(&self) -> &str {
        "subagent_terminate"
    }

    fn description(&self) -> &str {
        "Terminate a sub-agent and all of its own sub-agents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chat_id": {"type": "string", "description": "Sub-agent chat ID"}
            },
            "required": ["chat_id"]
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResultBlock {
        finish(call, self.run(call, ctx).await)
    }
}

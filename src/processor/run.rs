//! One claimed chat, from running status to release.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ProcessorInner;
use super::active::{CancelCause, RunHandle};
use super::prompt::{
    NO_WORKSPACE_INSTRUCTION, REPORT_ONLY_INSTRUCTION, append_system_instruction,
    chat_messages_to_prompt, prepend_system_instruction, step_assistant_content,
};
use crate::agent::{Agent, AgentHooks, PreparedStep, StepResult};
use crate::chat::content::{ToolResultBlock, marshal_content_blocks, marshal_tool_results};
use crate::chat::model::{Chat, ChatMessage, ChatStatus, MessageRole, NewChatMessage, TaskStatus};
use crate::chat::title::{chat_title_input, generate_chat_title};
use crate::error::ChatError;
use crate::llm::{LanguageModel, Message};
use crate::store::ChatStore;
use crate::stream::{MessagePart, StreamEvent, StreamManager};
use crate::subagent::{SUBAGENT_REPORT_TOOL, pending_request_in, report_only_requested};
use crate::tools::ToolCall;
use crate::tools::tool::ToolContext;
use crate::tools::workspace::WorkspaceConnCell;

/// Error reason for a recovered panic payload.
pub(crate) fn panic_failure_reason(payload: &(dyn Any + Send)) -> String {
    let reason = if let Some(s) = payload.downcast_ref::<&str>() {
        s.trim().to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.trim().to_string()
    } else {
        String::new()
    };

    if reason.is_empty() {
        "chat processing panicked".to_string()
    } else {
        ChatError::Panicked(reason).to_string()
    }
}

/// Delegation state of a child run, decided before the agent starts.
#[derive(Debug, Clone, Copy)]
struct ChildRun {
    /// Pending request in the transcript this run was given.
    request_id: Option<Uuid>,
    report_only: bool,
}

impl ProcessorInner {
    // ── Events ──────────────────────────────────────────────────────

    fn publish_status(&self, chat_id: Uuid, status: ChatStatus) {
        self.streams.publish(chat_id, StreamEvent::status(chat_id, status));
    }

    fn publish_error(&self, chat_id: Uuid, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.streams.publish(chat_id, StreamEvent::error(chat_id, message));
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Run a claimed chat and release it with its final status.
    ///
    /// Never panics: a panic inside the run becomes an `Error` status.
    pub(super) async fn process_chat(&self, chat: Chat) {
        let chat_id = chat.id;
        info!(chat_id = %chat_id, "Processing chat");

        let handle = self.active.register(chat_id, &self.shutdown);
        self.publish_status(chat_id, ChatStatus::Running);

        let outcome = AssertUnwindSafe(self.run_until_cancelled(chat, &handle))
            .catch_unwind()
            .await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(ChatError::Interrupted)) => {
                info!(chat_id = %chat_id, "Chat interrupted");
                ChatStatus::Waiting
            }
            Ok(Err(ChatError::Shutdown)) => {
                info!(chat_id = %chat_id, "Releasing chat for shutdown");
                ChatStatus::Pending
            }
            Ok(Err(e)) => {
                error!(chat_id = %chat_id, error = %e, "Failed to process chat");
                self.publish_error(chat_id, &e.to_string());
                ChatStatus::Error
            }
            Err(payload) => {
                let reason = panic_failure_reason(payload.as_ref());
                error!(chat_id = %chat_id, panic = %reason, "Panic during chat processing");
                self.publish_error(chat_id, &reason);
                ChatStatus::Error
            }
        };

        self.streams.stop_stream(chat_id);
        if let Err(e) = self
            .store
            .update_chat_status(chat_id, status, None, None)
            .await
        {
            error!(chat_id = %chat_id, error = %e, "Failed to release chat");
        }
        self.publish_status(chat_id, status);
        self.active.unregister(chat_id, &handle);
        debug!(chat_id = %chat_id, status = %status, "Released chat");
    }

    async fn run_until_cancelled(
        &self,
        chat: Chat,
        handle: &RunHandle,
    ) -> Result<ChatStatus, ChatError> {
        tokio::select! {
            biased;
            _ = handle.token.cancelled() => Err(match handle.cause() {
                CancelCause::Interrupted => ChatError::Interrupted,
                CancelCause::Shutdown => ChatError::Shutdown,
            }),
            result = self.run_chat(chat) => result,
        }
    }

    /// Drive one run of the agent loop. Returns the status to release with.
    async fn run_chat(&self, chat: Chat) -> Result<ChatStatus, ChatError> {
        let messages = self.store.get_chat_messages(chat.id).await?;
        let model = self.model_resolver.resolve(&chat)?;

        self.maybe_generate_title(&chat, &messages, model.as_ref()).await;
        let chat = self.recover_missing_workspace(chat).await?;
        let child = self.begin_child_run(&chat, &messages).await?;

        let mut prompt = chat_messages_to_prompt(&messages)?;
        if chat.workspace_id.is_none() {
            prompt = prepend_system_instruction(prompt, NO_WORKSPACE_INSTRUCTION);
        }
        if child.is_some_and(|c| c.report_only) {
            prompt = append_system_instruction(prompt, REPORT_ONLY_INSTRUCTION);
        }

        self.streams.start_stream(chat.id);
        let result = self.run_agent(&chat, model, prompt, child).await;
        self.streams.stop_stream(chat.id);
        let result = result?;

        if result.hit_step_limit(self.config.max_chat_steps) {
            return Err(ChatError::StepLimit(self.config.max_chat_steps));
        }

        match child {
            Some(child) => self.finish_child_run(&chat, child).await,
            None => Ok(ChatStatus::Waiting),
        }
    }

    async fn run_agent(
        &self,
        chat: &Chat,
        model: Arc<dyn LanguageModel>,
        prompt: Vec<Message>,
        child: Option<ChildRun>,
    ) -> Result<crate::agent::AgentResult, ChatError> {
        let ctx = ToolContext {
            chat_id: chat.id,
            chat: Arc::new(tokio::sync::Mutex::new(chat.clone())),
            model: Arc::clone(&model),
            store: Arc::clone(&self.store),
            streams: self.streams.clone(),
            subagents: Arc::clone(&self.subagents),
            connections: Arc::new(WorkspaceConnCell::new()),
            agent_connector: self.agent_connector.clone(),
            workspace_creator: self.workspace_creator.clone(),
            execute_timeout: self.config.execute_timeout,
            subagent_await_timeout: self.config.subagent_await_timeout,
        };
        let hooks = PersistHooks {
            chat_id: chat.id,
            store: self.store.as_ref(),
            streams: &self.streams,
            request_id: child.and_then(|c| c.request_id),
            active_tools: child
                .is_some_and(|c| c.report_only)
                .then(|| vec![SUBAGENT_REPORT_TOOL.to_string()]),
        };

        Agent::new(model, Arc::clone(&self.tools), self.config.max_chat_steps)
            .run(prompt, &ctx, &hooks)
            .await
    }

    // ── Best-effort side work ───────────────────────────────────────

    async fn maybe_generate_title(
        &self,
        chat: &Chat,
        messages: &[ChatMessage],
        model: &dyn LanguageModel,
    ) {
        let input = match chat_title_input(chat, messages) {
            Ok(Some(input)) => input,
            Ok(None) => return,
            Err(e) => {
                warn!(chat_id = %chat.id, error = %e, "Failed to read chat title input");
                return;
            }
        };

        let generated = tokio::time::timeout(
            self.config.title_timeout,
            generate_chat_title(model, &self.config.title_prompt, &input),
        )
        .await;
        let title = match generated {
            Ok(Ok(title)) => title,
            Ok(Err(e)) => {
                warn!(chat_id = %chat.id, error = %e, "Failed to generate chat title");
                return;
            }
            Err(_) => {
                warn!(chat_id = %chat.id, "Timed out generating chat title");
                return;
            }
        };
        if title == chat.title {
            return;
        }
        if let Err(e) = self.store.update_chat_title(chat.id, &title).await {
            warn!(chat_id = %chat.id, error = %e, "Failed to update generated chat title");
        }
    }

    /// Clear the workspace linkage when the workspace is gone.
    async fn recover_missing_workspace(&self, chat: Chat) -> Result<Chat, ChatError> {
        let Some(workspace_id) = chat.workspace_id else {
            return Ok(chat);
        };
        match self.store.get_workspace(workspace_id).await? {
            Some(workspace) if !workspace.deleted => Ok(chat),
            _ => {
                let updated = self.store.update_chat_workspace(chat.id, None, None).await?;
                info!(
                    chat_id = %chat.id,
                    workspace_id = %workspace_id,
                    "Chat workspace no longer exists, cleared workspace linkage"
                );
                Ok(updated)
            }
        }
    }

    // ── Delegated children ──────────────────────────────────────────

    async fn begin_child_run(
        &self,
        chat: &Chat,
        messages: &[ChatMessage],
    ) -> Result<Option<ChildRun>, ChatError> {
        if chat.parent_chat_id.is_none() {
            return Ok(None);
        }

        let request_id = pending_request_in(messages);
        let report_only = request_id.is_some_and(|id| report_only_requested(messages, id));
        if !report_only {
            self.store
                .update_chat_task_status(chat.id, Some(TaskStatus::Running))
                .await?;
        }
        Ok(Some(ChildRun {
            request_id,
            report_only,
        }))
    }

    /// Decide how a child that finished cleanly is released.
    ///
    /// A child that still owes a report for the request it worked on gets
    /// exactly one report-only pass; if that pass also ends without a
    /// report, one is synthesized. A request that arrived while the run was
    /// in flight gets a full pass of its own.
    async fn finish_child_run(&self, chat: &Chat, child: ChildRun) -> Result<ChatStatus, ChatError> {
        if self.subagents.has_active_descendants(chat.id).await? {
            return Ok(ChatStatus::Waiting);
        }
        let Some(request_id) = self.subagents.latest_pending_request_id(chat.id).await? else {
            return Ok(ChatStatus::Waiting);
        };

        if child.request_id != Some(request_id) {
            // The earlier request was worked on; it only owes a report now.
            if let Some(worked) = child.request_id.filter(|_| !child.report_only) {
                let answered = self
                    .store
                    .get_subagent_response_message(chat.id, worked)
                    .await?
                    .is_some();
                if !answered {
                    self.subagents
                        .mark_report_only_pass_requested(chat.id, worked)
                        .await?;
                }
            }
            self.store
                .update_chat_task_status(chat.id, Some(TaskStatus::Queued))
                .await?;
            debug!(chat_id = %chat.id, request_id = %request_id, "Requeued subagent for request sent during run");
            return Ok(ChatStatus::Pending);
        }

        if child.report_only {
            let report = self
                .subagents
                .synthesize_fallback_report(chat.id, request_id)
                .await;
            warn!(chat_id = %chat.id, request_id = %request_id, "Subagent finished without reporting, using fallback report");
            self.subagents
                .mark_reported(chat.id, &report, Some(request_id))
                .await?;
            if self.subagents.latest_pending_request_id(chat.id).await?.is_some() {
                self.store
                    .update_chat_task_status(chat.id, Some(TaskStatus::Queued))
                    .await?;
                return Ok(ChatStatus::Pending);
            }
            return Ok(ChatStatus::Waiting);
        }

        self.subagents
            .mark_report_only_pass_requested(chat.id, request_id)
            .await?;
        self.store
            .update_chat_task_status(chat.id, Some(TaskStatus::AwaitingReport))
            .await?;
        debug!(chat_id = %chat.id, request_id = %request_id, "Requeued subagent for report-only pass");
        Ok(ChatStatus::Pending)
    }
}

// ── Hooks ───────────────────────────────────────────────────────────

/// Streams every delta and persists each finished step.
struct PersistHooks<'a> {
    chat_id: Uuid,
    store: &'a dyn ChatStore,
    streams: &'a StreamManager,
    /// Request the child is working on; tags its assistant turns.
    request_id: Option<Uuid>,
    active_tools: Option<Vec<String>>,
}

impl PersistHooks<'_> {
    fn publish_part(&self, role: MessageRole, part: MessagePart) {
        self.streams
            .publish(self.chat_id, StreamEvent::message_part(self.chat_id, role, part));
    }

    async fn persist(&self, message: NewChatMessage) -> Result<(), ChatError> {
        let stored = self.store.insert_chat_message(message).await?;
        self.streams
            .publish(self.chat_id, StreamEvent::message(self.chat_id, stored));
        Ok(())
    }
}

#[async_trait]
impl AgentHooks for PersistHooks<'_> {
    fn prepare_step(&self, _step: usize, messages: Vec<Message>) -> PreparedStep {
        PreparedStep {
            messages,
            active_tools: self.active_tools.clone(),
        }
    }

    fn on_text_delta(&self, delta: &str) {
        self.publish_part(MessageRole::Assistant, MessagePart::text_delta(delta));
    }

    fn on_reasoning_delta(&self, delta: &str) {
        self.publish_part(MessageRole::Assistant, MessagePart::reasoning_delta(delta));
    }

    fn on_tool_input_delta(&self, id: &str, name: &str, delta: &str) {
        self.publish_part(
            MessageRole::Assistant,
            MessagePart::tool_call_delta(id, name, delta),
        );
    }

    fn on_tool_call(&self, call: &ToolCall) {
        self.publish_part(
            MessageRole::Assistant,
            MessagePart::tool_call(&call.id, &call.name, call.input.as_str()),
        );
    }

    fn on_source(&self, id: &str, url: &str, title: &str) {
        let title = (!title.is_empty()).then_some(title);
        self.publish_part(MessageRole::Assistant, MessagePart::source(id, url, title));
    }

    fn on_tool_result(&self, result: &ToolResultBlock) {
        self.publish_part(MessageRole::Tool, MessagePart::tool_result(result));
    }

    async fn on_step_finish(&self, step: &StepResult) -> Result<(), ChatError> {
        let content = step_assistant_content(&step.content, &step.tool_results);
        if !content.is_empty() {
            let mut message = NewChatMessage::new(
                self.chat_id,
                MessageRole::Assistant,
                marshal_content_blocks(&content),
            );
            if let Some(request_id) = self.request_id {
                message = message.with_subagent(request_id, None);
            }
            self.persist(message).await?;
        }

        for result in &step.tool_results {
            self.persist(
                NewChatMessage::new(
                    self.chat_id,
                    MessageRole::Tool,
                    marshal_tool_results(std::slice::from_ref(result)),
                )
                .with_tool_call_id(&result.tool_call_id),
            )
            .await?;
        }
        Ok(())
    }
}

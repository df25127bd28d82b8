//! Delegation service: child chats, request/response correlation and
//! in-memory waiting for reports.
//!
//! A request is a visible user message on the child tagged with a request id
//! and the `request` event. It is answered by a hidden response marker with
//! the same id. Results are cached per `(chat, request)` so late awaiters
//! return immediately; a fresh request with the same key clears the cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chat::content::{
    ContentBlock, ToolResultBlock, content_blocks_to_text, marshal_content_blocks,
    marshal_tool_results, parse_content_blocks, text_content,
};
use crate::chat::model::{
    Chat, ChatMessage, ChatStatus, MessageRole, NewChat, NewChatMessage, SubagentEvent, TaskStatus,
};
use crate::chat::title::fallback_chat_title;
use crate::error::SubagentError;
use crate::store::ChatStore;

pub const SUBAGENT_REPORT_TOOL: &str = "subagent_report";
pub const REPORT_TOOL_CALL_ID_PREFIX: &str = "subagent_report_";
pub const DEFAULT_FALLBACK_REPORT: &str = "Sub-agent completed without explicit report.";
pub const REPORT_ONLY_MARKER_TEXT: &str = "report-only pass requested";
pub const TERMINATED_REPORT: &str = "terminated";

/// How long a resolved report stays in the in-memory cache.
const RESULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Interrupts a running chat. Returns whether a run was interrupted.
pub trait Interrupter: Send + Sync {
    fn interrupt_chat(&self, chat_id: Uuid) -> bool;
}

/// Outcome of a delegated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentAwaitResult {
    pub request_id: Uuid,
    pub report: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RequestKey {
    chat_id: Uuid,
    request_id: Uuid,
}

struct CachedResult {
    result: SubagentAwaitResult,
    stored_at: Instant,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<RequestKey, Vec<oneshot::Sender<SubagentAwaitResult>>>,
    results: HashMap<RequestKey, CachedResult>,
}

impl Waiters {
    fn result(&self, key: &RequestKey) -> Option<SubagentAwaitResult> {
        self.results
            .get(key)
            .filter(|c| c.stored_at.elapsed() < RESULT_TTL)
            .map(|c| c.result.clone())
    }

    /// Cache `result`, evicting entries older than [`RESULT_TTL`].
    fn store_result(&mut self, key: RequestKey, result: SubagentAwaitResult, now: Instant) {
        self.results
            .retain(|_, c| now.saturating_duration_since(c.stored_at) < RESULT_TTL);
        self.results.insert(
            key,
            CachedResult {
                result,
                stored_at: now,
            },
        );
    }

    /// Drop closed senders for `key`, and the slot itself once empty.
    fn prune(&mut self, key: RequestKey) {
        if let Some(slot) = self.pending.get_mut(&key) {
            slot.retain(|tx| !tx.is_closed());
            if slot.is_empty() {
                self.pending.remove(&key);
            }
        }
    }
}

/// A registered waiter. Dropping it, on timeout, error or cancellation of
/// the awaiting future, unregisters it.
struct WaiterGuard<'a> {
    waiters: &'a Mutex<Waiters>,
    key: RequestKey,
    rx: oneshot::Receiver<SubagentAwaitResult>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.prune(self.key);
        }
    }
}

pub fn report_tool_call_id(request_id: Uuid) -> String {
    format!("{REPORT_TOOL_CALL_ID_PREFIX}{request_id}")
}

/// Newest request in `messages` that has no response yet.
pub fn pending_request_in(messages: &[ChatMessage]) -> Option<Uuid> {
    let answered: HashSet<Uuid> = messages
        .iter()
        .filter(|m| m.subagent_event == Some(SubagentEvent::Response))
        .filter_map(|m| m.subagent_request_id)
        .collect();
    messages
        .iter()
        .rev()
        .filter(|m| m.subagent_event == Some(SubagentEvent::Request))
        .filter_map(|m| m.subagent_request_id)
        .find(|id| !id.is_nil() && !answered.contains(id))
}

/// Whether a report-only pass was requested for `request_id` after the
/// request itself was last sent.
///
/// Only the request and the report-only marker count; other messages tagged
/// with the request, such as the child's own assistant turns, do not.
pub fn report_only_requested(messages: &[ChatMessage], request_id: Uuid) -> bool {
    messages
        .iter()
        .rev()
        .filter(|m| m.subagent_request_id == Some(request_id))
        .find(|m| {
            m.subagent_event == Some(SubagentEvent::Request)
                || m.role == MessageRole::SubagentReportOnlyMarker
        })
        .is_some_and(|m| m.role == MessageRole::SubagentReportOnlyMarker)
}

pub struct SubagentService {
    store: Arc<dyn ChatStore>,
    interrupter: Arc<dyn Interrupter>,
    await_timeout: Duration,
    poll_interval: Duration,
    waiters: Mutex<Waiters>,
}

impl SubagentService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        interrupter: Arc<dyn Interrupter>,
        await_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            interrupter,
            await_timeout,
            poll_interval,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Create a child of `parent` and send it its first request.
    ///
    /// The child inherits the parent's owner, workspace and model selection
    /// and is always queued, regardless of whether the caller then awaits.
    pub async fn create_child(
        &self,
        parent: &Chat,
        prompt: &str,
        title: Option<&str>,
    ) -> Result<(Chat, Uuid), SubagentError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(SubagentError::PromptRequired);
        }
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => fallback_chat_title(prompt),
        };

        let mut new = NewChat::new(parent.owner_id, title).with_model_config(parent.model_config.clone());
        new.parent_chat_id = Some(parent.id);
        new.root_chat_id = Some(parent.root_chat_id.unwrap_or(parent.id));
        new.workspace_id = parent.workspace_id;
        new.workspace_agent_id = parent.workspace_agent_id;
        new.task_status = Some(TaskStatus::Queued);
        let child = self.store.insert_chat(new).await?;

        let request_id = Uuid::new_v4();
        self.insert_request_message(child.id, prompt, request_id).await?;
        let child = self.requeue_if_idle(child).await?;
        self.clear_cached_result(child.id, request_id);

        info!(parent_id = %parent.id, chat_id = %child.id, request_id = %request_id, "Created subagent chat");
        Ok((child, request_id))
    }

    /// Send a follow-up request to a descendant of `parent_id`.
    pub async fn send_message(
        &self,
        parent_id: Uuid,
        target_id: Uuid,
        message: &str,
    ) -> Result<(Chat, Uuid), SubagentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SubagentError::MessageRequired);
        }
        if !self.is_descendant(parent_id, target_id).await? {
            return Err(SubagentError::NotDescendant);
        }

        let target = self.get_chat(target_id).await?;
        let request_id = Uuid::new_v4();
        self.insert_request_message(target_id, message, request_id).await?;
        self.store
            .update_chat_task_status(target_id, Some(TaskStatus::Queued))
            .await?;
        let target = self.requeue_if_idle(target).await?;
        self.clear_cached_result(target_id, request_id);
        Ok((target, request_id))
    }

    async fn insert_request_message(
        &self,
        chat_id: Uuid,
        text: &str,
        request_id: Uuid,
    ) -> Result<ChatMessage, SubagentError> {
        let message = NewChatMessage::new(chat_id, MessageRole::User, text_content(text))
            .with_subagent(request_id, Some(SubagentEvent::Request));
        Ok(self.store.insert_chat_message(message).await?)
    }

    async fn requeue_if_idle(&self, chat: Chat) -> Result<Chat, SubagentError> {
        if !chat.status.is_idle() {
            return Ok(chat);
        }
        Ok(self
            .store
            .update_chat_status(chat.id, ChatStatus::Pending, None, None)
            .await?)
    }

    async fn get_chat(&self, id: Uuid) -> Result<Chat, SubagentError> {
        self.store
            .get_chat_by_id(id)
            .await?
            .ok_or(SubagentError::ChatNotFound(id))
    }

    /// Newest request on `chat_id` still waiting for a response.
    pub async fn latest_pending_request_id(&self, chat_id: Uuid) -> Result<Option<Uuid>, SubagentError> {
        Ok(self
            .store
            .get_latest_pending_subagent_request_id(chat_id)
            .await?
            .filter(|id| !id.is_nil()))
    }

    // ── Report-only pass ────────────────────────────────────────────

    /// Whether the next run of `chat_id` should only ask for a report.
    pub async fn should_run_report_only_pass(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<bool, SubagentError> {
        let messages = self.store.get_chat_messages(chat_id).await?;
        Ok(report_only_requested(&messages, request_id))
    }

    pub async fn mark_report_only_pass_requested(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<(), SubagentError> {
        let marker = NewChatMessage::new(
            chat_id,
            MessageRole::SubagentReportOnlyMarker,
            text_content(REPORT_ONLY_MARKER_TEXT),
        )
        .hidden()
        .with_subagent(request_id, None);
        self.store.insert_chat_message(marker).await?;
        Ok(())
    }

    /// Best available report when the child never called `subagent_report`.
    pub async fn synthesize_fallback_report(&self, chat_id: Uuid, request_id: Uuid) -> String {
        let Ok(messages) = self.store.get_chat_messages(chat_id).await else {
            return DEFAULT_FALLBACK_REPORT.to_string();
        };

        let assistant_text = |m: &ChatMessage| -> Option<String> {
            if m.role != MessageRole::Assistant {
                return None;
            }
            let blocks = parse_content_blocks(m.role, m.content.as_ref()).ok()?;
            let text = content_blocks_to_text(&blocks);
            (!text.is_empty()).then_some(text)
        };

        messages
            .iter()
            .rev()
            .filter(|m| m.subagent_request_id == Some(request_id))
            .find_map(assistant_text)
            .or_else(|| messages.iter().rev().find_map(assistant_text))
            .unwrap_or_else(|| DEFAULT_FALLBACK_REPORT.to_string())
    }

    // ── Reports ─────────────────────────────────────────────────────

    /// Answer a request on `chat_id` with `report`.
    ///
    /// Without an explicit request id the latest pending request is
    /// answered. The report is mirrored into the parent transcript, waiters
    /// are released and an idle parent is requeued.
    pub async fn mark_reported(
        &self,
        chat_id: Uuid,
        report: &str,
        request_id: Option<Uuid>,
    ) -> Result<SubagentAwaitResult, SubagentError> {
        self.report(chat_id, report, request_id, true).await
    }

    async fn report(
        &self,
        chat_id: Uuid,
        report: &str,
        request_id: Option<Uuid>,
        requeue_parent: bool,
    ) -> Result<SubagentAwaitResult, SubagentError> {
        let report = report.trim();
        let chat = self.get_chat(chat_id).await?;

        let request_id = match request_id.filter(|id| !id.is_nil()) {
            Some(id) => id,
            None => self
                .latest_pending_request_id(chat_id)
                .await?
                .ok_or(SubagentError::NoPendingRequest)?,
        };

        let marker = NewChatMessage::new(
            chat_id,
            MessageRole::SubagentResponseMarker,
            text_content(report),
        )
        .hidden()
        .with_subagent(request_id, Some(SubagentEvent::Response));
        self.store.insert_chat_message(marker).await?;

        self.store
            .update_chat_task_status(chat_id, Some(TaskStatus::Reported))
            .await?;
        self.store.update_chat_task_report(chat_id, report).await?;

        if let Some(parent_id) = chat.parent_chat_id {
            self.insert_parent_report(parent_id, chat_id, request_id, report)
                .await?;
        }

        let result = self
            .response_for_request(chat_id, request_id)
            .await?
            .unwrap_or_else(|| SubagentAwaitResult {
                request_id,
                report: report.to_string(),
                duration_ms: 0,
            });
        self.resolve_waiters(
            RequestKey {
                chat_id,
                request_id,
            },
            result.clone(),
        );

        if let Some(parent_id) = chat.parent_chat_id.filter(|_| requeue_parent) {
            let parent = self.get_chat(parent_id).await?;
            let parent = self.requeue_if_idle(parent).await?;
            debug!(parent_id = %parent_id, status = %parent.status, "Parent status after subagent report");
        }

        Ok(result)
    }

    /// A hidden assistant tool call plus a visible tool result, so the
    /// parent's transcript stays well-formed for the model.
    async fn insert_parent_report(
        &self,
        parent_id: Uuid,
        child_id: Uuid,
        request_id: Uuid,
        report: &str,
    ) -> Result<(), SubagentError> {
        let tool_call_id = report_tool_call_id(request_id);

        let call = marshal_content_blocks(&[ContentBlock::ToolCall {
            tool_call_id: tool_call_id.clone(),
            tool_name: SUBAGENT_REPORT_TOOL.to_string(),
            input: "{}".to_string(),
        }]);
        self.store
            .insert_chat_message(
                NewChatMessage::new(parent_id, MessageRole::Assistant, call)
                    .with_tool_call_id(&tool_call_id)
                    .hidden(),
            )
            .await?;

        let result = ToolResultBlock::base(&tool_call_id, SUBAGENT_REPORT_TOOL).with_result(json!({
            "chat_id": child_id.to_string(),
            "request_id": request_id.to_string(),
            "report": report,
            "status": "reported",
            "duration_ms": null,
        }));
        self.store
            .insert_chat_message(
                NewChatMessage::new(parent_id, MessageRole::Tool, marshal_tool_results(&[result]))
                    .with_tool_call_id(&tool_call_id),
            )
            .await?;
        Ok(())
    }

    async fn response_for_request(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<SubagentAwaitResult>, SubagentError> {
        let Some(message) = self
            .store
            .get_subagent_response_message(chat_id, request_id)
            .await?
        else {
            return Ok(None);
        };
        let duration_ms = self
            .store
            .get_subagent_request_duration(chat_id, request_id)
            .await?;
        let report = parse_content_blocks(message.role, message.content.as_ref())
            .map(|blocks| content_blocks_to_text(&blocks))
            .unwrap_or_default();

        Ok(Some(SubagentAwaitResult {
            request_id,
            report,
            duration_ms,
        }))
    }

    // ── Waiting ─────────────────────────────────────────────────────

    /// Wait for the report on `request_id` of descendant `target_id`.
    ///
    /// A zero `timeout` uses the configured default. Wakes on an in-process
    /// report immediately and polls the store for reports written elsewhere.
    pub async fn await_report(
        &self,
        parent_id: Uuid,
        target_id: Uuid,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<SubagentAwaitResult, SubagentError> {
        if !self.is_descendant(parent_id, target_id).await? {
            return Err(SubagentError::NotDescendant);
        }

        let key = RequestKey {
            chat_id: target_id,
            request_id,
        };
        if let Some(result) = self.cached_result(key) {
            return Ok(result);
        }
        if let Some(result) = self.response_for_request(target_id, request_id).await? {
            self.cache_result(key, result.clone());
            return Ok(result);
        }

        let mut waiter = match self.register_waiter(key) {
            Ok(guard) => guard,
            Err(result) => return Ok(result),
        };

        let timeout = if timeout.is_zero() {
            self.await_timeout
        } else {
            timeout
        };
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                // A closed waiter disables this branch; polling continues.
                Ok(result) = &mut waiter.rx => return Ok(result),
                _ = ticker.tick() => {
                    if let Some(result) = self.response_for_request(target_id, request_id).await? {
                        self.resolve_waiters(key, result.clone());
                        return Ok(result);
                    }
                }
                _ = &mut deadline => return Err(SubagentError::Timeout),
            }
        }
    }

    fn cached_result(&self, key: RequestKey) -> Option<SubagentAwaitResult> {
        let waiters = self.waiters.lock().expect("subagent waiters poisoned");
        waiters.result(&key)
    }

    fn cache_result(&self, key: RequestKey, result: SubagentAwaitResult) {
        let mut waiters = self.waiters.lock().expect("subagent waiters poisoned");
        waiters.store_result(key, result, Instant::now());
    }

    fn clear_cached_result(&self, chat_id: Uuid, request_id: Uuid) {
        let mut waiters = self.waiters.lock().expect("subagent waiters poisoned");
        waiters.results.remove(&RequestKey {
            chat_id,
            request_id,
        });
    }

    /// Register a waiter, or return the cached result if one landed first.
    fn register_waiter(&self, key: RequestKey) -> Result<WaiterGuard<'_>, SubagentAwaitResult> {
        let mut waiters = self.waiters.lock().expect("subagent waiters poisoned");
        if let Some(result) = waiters.result(&key) {
            return Err(result);
        }
        let (tx, rx) = oneshot::channel();
        waiters.pending.entry(key).or_default().push(tx);
        Ok(WaiterGuard {
            waiters: &self.waiters,
            key,
            rx,
        })
    }

    fn resolve_waiters(&self, key: RequestKey, result: SubagentAwaitResult) {
        let senders = {
            let mut waiters = self.waiters.lock().expect("subagent waiters poisoned");
            waiters.store_result(key, result.clone(), Instant::now());
            waiters.pending.remove(&key).unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(result.clone());
        }
    }

    // ── Tree operations ─────────────────────────────────────────────

    /// Stop `target_id` and everything below it, answering every open
    /// request with "terminated".
    pub async fn terminate_subtree(&self, parent_id: Uuid, target_id: Uuid) -> Result<(), SubagentError> {
        if !self.is_descendant(parent_id, target_id).await? {
            return Err(SubagentError::NotDescendant);
        }

        let mut subtree = vec![self.get_chat(target_id).await?];
        subtree.extend(self.list_descendants(target_id).await?);
        let ids: HashSet<Uuid> = subtree.iter().map(|c| c.id).collect();

        for chat in subtree {
            // Reports flowing inside the subtree must not wake a chat that
            // is being terminated.
            let requeue_parent = chat.parent_chat_id.is_some_and(|id| !ids.contains(&id));
            match chat.status {
                ChatStatus::Running => {
                    let interrupted = self.interrupter.interrupt_chat(chat.id);
                    debug!(chat_id = %chat.id, interrupted, "Interrupting terminated subagent");
                }
                ChatStatus::Pending => {
                    self.store
                        .update_chat_status(chat.id, ChatStatus::Waiting, None, None)
                        .await?;
                }
                _ => {}
            }

            while let Some(request_id) = self.latest_pending_request_id(chat.id).await? {
                self.report(chat.id, TERMINATED_REPORT, Some(request_id), requeue_parent)
                    .await?;
            }
        }

        info!(parent_id = %parent_id, chat_id = %target_id, "Terminated subagent subtree");
        Ok(())
    }

    /// Whether any descendant of `chat_id` still owes a report.
    pub async fn has_active_descendants(&self, chat_id: Uuid) -> Result<bool, SubagentError> {
        for descendant in self.list_descendants(chat_id).await? {
            if self.latest_pending_request_id(descendant.id).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `target_id` sits strictly below `ancestor_id`.
    pub async fn is_descendant(&self, ancestor_id: Uuid, target_id: Uuid) -> Result<bool, SubagentError> {
        if ancestor_id == target_id {
            return Ok(false);
        }
        Ok(self
            .list_descendants(ancestor_id)
            .await?
            .iter()
            .any(|c| c.id == target_id))
    }

    /// All chats below `chat_id`, breadth first.
    pub async fn list_descendants(&self, chat_id: Uuid) -> Result<Vec<Chat>, SubagentError> {
        let mut queue = VecDeque::from([chat_id]);
        let mut visited = HashSet::from([chat_id]);
        let mut out = Vec::new();

        while let Some(parent_id) = queue.pop_front() {
            for child in self.store.list_child_chats(parent_id).await? {
                if !visited.insert(child.id) {
                    continue;
                }
                queue.push_back(child.id);
                out.push(child);
            }
        }
        Ok(out)
    }
}

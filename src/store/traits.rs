//! `ChatStore`: the async interface for chat persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chat::model::{
    Chat, ChatMessage, ChatStatus, NewChat, NewChatMessage, TaskStatus, Workspace,
};
use crate::error::DatabaseError;

/// Backend-agnostic persistence for chats, their messages and the
/// workspace state the processor reads.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // ── Claims ──────────────────────────────────────────────────────

    /// Atomically claim the oldest pending chat for `worker_id`.
    ///
    /// Flips it to running with the given start time. `None` when nothing
    /// is pending.
    async fn acquire_chat(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Chat>, DatabaseError>;

    /// Set a chat's status together with its claim markers.
    async fn update_chat_status(
        &self,
        id: Uuid,
        status: ChatStatus,
        worker_id: Option<Uuid>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<Chat, DatabaseError>;

    /// Running chats claimed before `before`.
    async fn get_stale_chats(&self, before: DateTime<Utc>) -> Result<Vec<Chat>, DatabaseError>;

    // ── Chats ───────────────────────────────────────────────────────

    async fn insert_chat(&self, chat: NewChat) -> Result<Chat, DatabaseError>;

    async fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DatabaseError>;

    /// Direct children of `parent_id`, oldest first.
    async fn list_child_chats(&self, parent_id: Uuid) -> Result<Vec<Chat>, DatabaseError>;

    async fn update_chat_title(&self, id: Uuid, title: &str) -> Result<Chat, DatabaseError>;

    /// Set or clear the workspace linkage of a chat.
    async fn update_chat_workspace(
        &self,
        id: Uuid,
        workspace_id: Option<Uuid>,
        workspace_agent_id: Option<Uuid>,
    ) -> Result<Chat, DatabaseError>;

    async fn update_chat_task_status(
        &self,
        id: Uuid,
        task_status: Option<TaskStatus>,
    ) -> Result<(), DatabaseError>;

    async fn update_chat_task_report(&self, id: Uuid, report: &str) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, DatabaseError>;

    /// All messages of a chat in append order.
    async fn get_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Newest delegation request on `chat_id` that has no response yet.
    async fn get_latest_pending_subagent_request_id(
        &self,
        chat_id: Uuid,
    ) -> Result<Option<Uuid>, DatabaseError>;

    /// The response marker recorded for a request, if any.
    async fn get_subagent_response_message(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<ChatMessage>, DatabaseError>;

    /// Milliseconds between a request and its response (0 if either is missing).
    async fn get_subagent_request_duration(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<i64, DatabaseError>;

    // ── Workspaces ──────────────────────────────────────────────────

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError>;

    /// Agents of a workspace, in the order they were upserted.
    async fn get_workspace_agents(&self, workspace_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    /// Record a workspace and replace its agent list.
    async fn upsert_workspace(
        &self,
        workspace: &Workspace,
        agent_ids: &[Uuid],
    ) -> Result<(), DatabaseError>;
}

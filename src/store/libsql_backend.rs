//! libSQL backend implementing the async `ChatStore` trait.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings with nanoseconds, so string comparison
//! in SQL matches time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chat::model::{
    Chat, ChatMessage, ChatStatus, MessageRole, NewChat, NewChatMessage, SubagentEvent,
    TaskStatus, Workspace,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::ChatStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_chat(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Chat>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_chat(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn query_chats(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Chat>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut chats = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => chats.push(row_to_chat(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(chats)
    }

    async fn query_message(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn event_time(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
        event: SubagentEvent,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let order = match event {
            SubagentEvent::Request => "ASC",
            SubagentEvent::Response => "DESC",
        };
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT created_at FROM chat_messages WHERE chat_id = ?1 AND subagent_request_id = ?2 AND subagent_event = ?3 ORDER BY id {order} LIMIT 1"
                ),
                params![chat_id.to_string(), request_id.to_string(), event.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subagent_request_duration: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let ts: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_subagent_request_duration: {e}")))?;
                Ok(Some(parse_datetime(&ts)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subagent_request_duration: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const CHAT_COLUMNS: &str = "id, owner_id, title, status, worker_id, started_at, parent_chat_id, root_chat_id, task_status, task_report, workspace_id, workspace_agent_id, model_config, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, chat_id, created_at, role, content, tool_call_id, hidden, subagent_request_id, subagent_event";

/// Canonical write format for timestamps.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_optional_uuid(s: Option<String>, column: &str) -> Result<Option<Uuid>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_uuid(&s, column))
        .transpose()
}

/// Convert `Option<Uuid>` to libsql Value.
fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn row_to_chat(row: &libsql::Row) -> Result<Chat, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("chat row parse: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let owner_id: String = row.get(1).map_err(get_err)?;
    let title: String = row.get(2).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let worker_id: Option<String> = row.get(4).ok();
    let started_at: Option<String> = row.get(5).ok();
    let parent_chat_id: Option<String> = row.get(6).ok();
    let root_chat_id: Option<String> = row.get(7).ok();
    let task_status: Option<String> = row.get(8).ok();
    let task_report: Option<String> = row.get(9).ok();
    let workspace_id: Option<String> = row.get(10).ok();
    let workspace_agent_id: Option<String> = row.get(11).ok();
    let model_config: String = row.get(12).map_err(get_err)?;
    let created_at: String = row.get(13).map_err(get_err)?;
    let updated_at: String = row.get(14).map_err(get_err)?;

    Ok(Chat {
        id: parse_uuid(&id, "chats.id")?,
        owner_id: parse_uuid(&owner_id, "chats.owner_id")?,
        title,
        status: status_str
            .parse::<ChatStatus>()
            .map_err(DatabaseError::Serialization)?,
        worker_id: parse_optional_uuid(worker_id, "chats.worker_id")?,
        started_at: parse_optional_datetime(&started_at),
        parent_chat_id: parse_optional_uuid(parent_chat_id, "chats.parent_chat_id")?,
        root_chat_id: parse_optional_uuid(root_chat_id, "chats.root_chat_id")?,
        task_status: task_status
            .map(|s| s.parse::<TaskStatus>())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        task_report,
        workspace_id: parse_optional_uuid(workspace_id, "chats.workspace_id")?,
        workspace_agent_id: parse_optional_uuid(workspace_agent_id, "chats.workspace_agent_id")?,
        model_config: serde_json::from_str(&model_config)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<ChatMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("message row parse: {e}"));

    let id: i64 = row.get(0).map_err(get_err)?;
    let chat_id: String = row.get(1).map_err(get_err)?;
    let created_at: String = row.get(2).map_err(get_err)?;
    let role: String = row.get(3).map_err(get_err)?;
    let content: Option<String> = row.get(4).ok();
    let tool_call_id: Option<String> = row.get(5).ok();
    let hidden: i64 = row.get(6).map_err(get_err)?;
    let request_id: Option<String> = row.get(7).ok();
    let event: Option<String> = row.get(8).ok();

    let content = content
        .map(|c| serde_json::from_str::<serde_json::Value>(&c))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("chat_messages.content: {e}")))?;

    Ok(ChatMessage {
        id,
        chat_id: parse_uuid(&chat_id, "chat_messages.chat_id")?,
        created_at: parse_datetime(&created_at),
        role: role.parse::<MessageRole>().map_err(DatabaseError::Serialization)?,
        content,
        tool_call_id,
        hidden: hidden != 0,
        subagent_request_id: parse_optional_uuid(request_id, "chat_messages.subagent_request_id")?,
        subagent_event: event
            .map(|e| e.parse::<SubagentEvent>())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ChatStore for LibSqlBackend {
    // ── Claims ──────────────────────────────────────────────────────

    async fn acquire_chat(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Chat>, DatabaseError> {
        let ts = fmt_datetime(&now);
        let chat = self
            .query_chat(
                "acquire_chat",
                &format!(
                    "UPDATE chats SET status = 'running', worker_id = ?1, started_at = ?2, updated_at = ?2
                     WHERE id = (SELECT id FROM chats WHERE status = 'pending' ORDER BY updated_at, id LIMIT 1)
                       AND status = 'pending'
                     RETURNING {CHAT_COLUMNS}"
                ),
                params![worker_id.to_string(), ts],
            )
            .await?;
        if let Some(ref chat) = chat {
            debug!(chat_id = %chat.id, worker_id = %worker_id, "Chat acquired");
        }
        Ok(chat)
    }

    async fn update_chat_status(
        &self,
        id: Uuid,
        status: ChatStatus,
        worker_id: Option<Uuid>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<Chat, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        self.query_chat(
            "update_chat_status",
            &format!(
                "UPDATE chats SET status = ?1, worker_id = ?2, started_at = ?3, updated_at = ?4 WHERE id = ?5 RETURNING {CHAT_COLUMNS}"
            ),
            params![
                status.as_str(),
                opt_uuid(worker_id),
                opt_text_owned(started_at.as_ref().map(fmt_datetime)),
                now,
                id.to_string()
            ],
        )
        .await?
        .ok_or_else(|| DatabaseError::chat_not_found(id))
    }

    async fn get_stale_chats(&self, before: DateTime<Utc>) -> Result<Vec<Chat>, DatabaseError> {
        self.query_chats(
            "get_stale_chats",
            &format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1 ORDER BY started_at"
            ),
            params![fmt_datetime(&before)],
        )
        .await
    }

    // ── Chats ───────────────────────────────────────────────────────

    async fn insert_chat(&self, chat: NewChat) -> Result<Chat, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        let model_config = serde_json::to_string(&chat.model_config)
            .map_err(|e| DatabaseError::Serialization(format!("model_config: {e}")))?;
        self.query_chat(
            "insert_chat",
            &format!(
                "INSERT INTO chats (id, owner_id, title, status, parent_chat_id, root_chat_id, task_status, workspace_id, workspace_agent_id, model_config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 RETURNING {CHAT_COLUMNS}"
            ),
            params![
                chat.id.to_string(),
                chat.owner_id.to_string(),
                chat.title,
                chat.status.as_str(),
                opt_uuid(chat.parent_chat_id),
                opt_uuid(chat.root_chat_id),
                opt_text_owned(chat.task_status.map(|s| s.as_str().to_string())),
                opt_uuid(chat.workspace_id),
                opt_uuid(chat.workspace_agent_id),
                model_config,
                now
            ],
        )
        .await?
        .ok_or_else(|| DatabaseError::Query("insert_chat: no row returned".to_string()))
    }

    async fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DatabaseError> {
        self.query_chat(
            "get_chat_by_id",
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
    }

    async fn list_child_chats(&self, parent_id: Uuid) -> Result<Vec<Chat>, DatabaseError> {
        self.query_chats(
            "list_child_chats",
            &format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE parent_chat_id = ?1 ORDER BY created_at, id"
            ),
            params![parent_id.to_string()],
        )
        .await
    }

    async fn update_chat_title(&self, id: Uuid, title: &str) -> Result<Chat, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        self.query_chat(
            "update_chat_title",
            &format!(
                "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3 RETURNING {CHAT_COLUMNS}"
            ),
            params![title, now, id.to_string()],
        )
        .await?
        .ok_or_else(|| DatabaseError::chat_not_found(id))
    }

    async fn update_chat_workspace(
        &self,
        id: Uuid,
        workspace_id: Option<Uuid>,
        workspace_agent_id: Option<Uuid>,
    ) -> Result<Chat, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        self.query_chat(
            "update_chat_workspace",
            &format!(
                "UPDATE chats SET workspace_id = ?1, workspace_agent_id = ?2, updated_at = ?3 WHERE id = ?4 RETURNING {CHAT_COLUMNS}"
            ),
            params![
                opt_uuid(workspace_id),
                opt_uuid(workspace_agent_id),
                now,
                id.to_string()
            ],
        )
        .await?
        .ok_or_else(|| DatabaseError::chat_not_found(id))
    }

    async fn update_chat_task_status(
        &self,
        id: Uuid,
        task_status: Option<TaskStatus>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE chats SET task_status = ?1 WHERE id = ?2",
                params![
                    opt_text_owned(task_status.map(|s| s.as_str().to_string())),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_chat_task_status: {e}")))?;
        Ok(())
    }

    async fn update_chat_task_report(&self, id: Uuid, report: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE chats SET task_report = ?1 WHERE id = ?2",
                params![report, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_chat_task_report: {e}")))?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        let content = message
            .content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("message content: {e}")))?;

        let inserted = self
            .query_message(
                "insert_chat_message",
                &format!(
                    "INSERT INTO chat_messages (chat_id, role, content, tool_call_id, hidden, subagent_request_id, subagent_event, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    message.chat_id.to_string(),
                    message.role.as_str(),
                    opt_text_owned(content),
                    opt_text_owned(message.tool_call_id),
                    message.hidden as i64,
                    opt_uuid(message.subagent_request_id),
                    opt_text_owned(message.subagent_event.map(|e| e.as_str().to_string())),
                    now
                ],
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_chat_message: no row returned".to_string()))?;

        debug!(chat_id = %inserted.chat_id, message_id = inserted.id, role = %inserted.role, "Chat message inserted");
        Ok(inserted)
    }

    async fn get_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ?1 ORDER BY id"),
                params![chat_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chat_messages: {e}")))?;
        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(row_to_message(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("get_chat_messages: {e}"))),
            }
        }
        Ok(messages)
    }

    async fn get_latest_pending_subagent_request_id(
        &self,
        chat_id: Uuid,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT m.subagent_request_id FROM chat_messages m
                 WHERE m.chat_id = ?1
                   AND m.subagent_event = 'request'
                   AND m.subagent_request_id IS NOT NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM chat_messages r
                       WHERE r.chat_id = m.chat_id
                         AND r.subagent_request_id = m.subagent_request_id
                         AND r.subagent_event = 'response'
                   )
                 ORDER BY m.id DESC LIMIT 1",
                params![chat_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_latest_pending_subagent_request_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row.get(0).map_err(|e| {
                    DatabaseError::Query(format!("get_latest_pending_subagent_request_id: {e}"))
                })?;
                Ok(Some(parse_uuid(&id, "chat_messages.subagent_request_id")?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_latest_pending_subagent_request_id: {e}"
            ))),
        }
    }

    async fn get_subagent_response_message(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<ChatMessage>, DatabaseError> {
        self.query_message(
            "get_subagent_response_message",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ?1 AND subagent_request_id = ?2 AND subagent_event = 'response' ORDER BY id DESC LIMIT 1"
            ),
            params![chat_id.to_string(), request_id.to_string()],
        )
        .await
    }

    async fn get_subagent_request_duration(
        &self,
        chat_id: Uuid,
        request_id: Uuid,
    ) -> Result<i64, DatabaseError> {
        let requested = self
            .event_time(chat_id, request_id, SubagentEvent::Request)
            .await?;
        let responded = self
            .event_time(chat_id, request_id, SubagentEvent::Response)
            .await?;
        let (Some(requested), Some(responded)) = (requested, responded) else {
            return Ok(0);
        };
        // Round up so a response written after its request never reports 0.
        let micros = (responded - requested).num_microseconds().unwrap_or(0).max(0);
        Ok((micros + 999) / 1000)
    }

    // ── Workspaces ──────────────────────────────────────────────────

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, deleted FROM workspaces WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workspace: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let get_err = |e: libsql::Error| DatabaseError::Query(format!("get_workspace: {e}"));
                let id: String = row.get(0).map_err(get_err)?;
                let name: String = row.get(1).map_err(get_err)?;
                let deleted: i64 = row.get(2).map_err(get_err)?;
                Ok(Some(Workspace {
                    id: parse_uuid(&id, "workspaces.id")?,
                    name,
                    deleted: deleted != 0,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_workspace: {e}"))),
        }
    }

    async fn get_workspace_agents(&self, workspace_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM workspace_agents WHERE workspace_id = ?1 ORDER BY position, id",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workspace_agents: {e}")))?;
        let mut ids = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("get_workspace_agents: {e}")))?;
                    ids.push(parse_uuid(&id, "workspace_agents.id")?);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("get_workspace_agents: {e}"))),
            }
        }
        Ok(ids)
    }

    async fn upsert_workspace(
        &self,
        workspace: &Workspace,
        agent_ids: &[Uuid],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workspaces (id, name, deleted) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, deleted = excluded.deleted",
            params![
                workspace.id.to_string(),
                workspace.name.clone(),
                workspace.deleted as i64
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_workspace: {e}")))?;

        conn.execute(
            "DELETE FROM workspace_agents WHERE workspace_id = ?1",
            params![workspace.id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_workspace agents: {e}")))?;

        for (position, agent_id) in agent_ids.iter().enumerate() {
            conn.execute(
                "INSERT INTO workspace_agents (id, workspace_id, position) VALUES (?1, ?2, ?3)",
                params![
                    agent_id.to_string(),
                    workspace.id.to_string(),
                    position as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_workspace agents: {e}")))?;
        }
        Ok(())
    }
}

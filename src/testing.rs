//! Fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use uuid::Uuid;

use crate::chat::model::NewChat;
use crate::error::{LlmError, WorkspaceError};
use crate::llm::{FinishReason, LanguageModel, ModelCall, ModelResponse, PartStream, StreamPart};
use crate::store::{ChatStore, LibSqlBackend};
use crate::stream::StreamManager;
use crate::subagent::{Interrupter, SubagentService};
use crate::tools::tool::ToolContext;
use crate::tools::workspace::{
    AgentConn, AgentConnector, BuildLog, CommandOutput, CommandSession, CreateWorkspaceRequest,
    CreateWorkspaceResult, FileEdits, WorkspaceConnCell, WorkspaceCreator,
};

// ── Model ───────────────────────────────────────────────────────────

/// Replays one scripted response per `stream` call and records prompts.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Vec<StreamPart>>>,
    pub calls: Mutex<Vec<ModelCall>>,
    pub title: Mutex<Option<String>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Vec<StreamPart>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> ModelCall {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

/// A text-only response.
pub fn text_response(text: &str) -> Vec<StreamPart> {
    vec![
        StreamPart::TextDelta(text.to_string()),
        StreamPart::Finish(FinishReason::Stop),
    ]
}

/// A response that calls one tool.
pub fn tool_response(id: &str, name: &str, input: &str) -> Vec<StreamPart> {
    vec![
        StreamPart::ToolInputStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamPart::ToolInputDelta {
            id: id.to_string(),
            delta: input.to_string(),
        },
        StreamPart::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
        },
        StreamPart::Finish(FinishReason::ToolCalls),
    ]
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn generate(&self, _call: ModelCall) -> Result<ModelResponse, LlmError> {
        let title = self.title.lock().unwrap().clone();
        match title {
            Some(text) => Ok(ModelResponse {
                content: vec![crate::chat::content::ContentBlock::text(text)],
                finish_reason: FinishReason::Stop,
            }),
            None => Err(LlmError::InvalidResponse {
                provider: "scripted".into(),
                reason: "no title scripted".into(),
            }),
        }
    }

    async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError> {
        self.calls.lock().unwrap().push(call);
        let parts = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_response("done"));
        Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
    }
}

// ── Workspace ───────────────────────────────────────────────────────

/// In-memory agent. Commands echo themselves unless scripted.
#[derive(Clone, Default)]
pub struct FakeAgentConn {
    pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub commands: Arc<Mutex<HashMap<String, CommandOutput>>>,
    pub hang: bool,
}

struct FakeSession {
    conn: FakeAgentConn,
}

#[async_trait]
impl CommandSession for FakeSession {
    async fn combined_output(&self, command: &str) -> Result<CommandOutput, WorkspaceError> {
        if self.conn.hang {
            std::future::pending::<()>().await;
        }
        let scripted = self.conn.commands.lock().unwrap().get(command).cloned();
        Ok(scripted.unwrap_or_else(|| CommandOutput {
            output: command.to_string(),
            exit_status: 0,
        }))
    }
}

#[async_trait]
impl AgentConn for FakeAgentConn {
    async fn read_file(
        &self,
        path: &str,
        _offset: i64,
        _limit: i64,
    ) -> Result<(Vec<u8>, String), WorkspaceError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .map(|data| (data, "text/plain".to_string()))
            .ok_or_else(|| WorkspaceError::Remote(format!("open {path}: no such file")))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn edit_files(&self, files: &[FileEdits]) -> Result<(), WorkspaceError> {
        let mut stored = self.files.lock().unwrap();
        for file in files {
            let current = stored
                .get(&file.path)
                .ok_or_else(|| WorkspaceError::Remote(format!("open {}: no such file", file.path)))?;
            let mut text = String::from_utf8_lossy(current).into_owned();
            for edit in &file.edits {
                text = text.replace(&edit.search, &edit.replace);
            }
            stored.insert(file.path.clone(), text.into_bytes());
        }
        Ok(())
    }

    async fn command_session(&self) -> Result<Box<dyn CommandSession>, WorkspaceError> {
        Ok(Box::new(FakeSession { conn: self.clone() }))
    }
}

pub struct FakeConnector {
    conn: FakeAgentConn,
    delay: Duration,
    dials: AtomicUsize,
}

impl FakeConnector {
    pub fn new(conn: FakeAgentConn) -> Self {
        Self {
            conn,
            delay: Duration::ZERO,
            dials: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self, _agent_id: Uuid) -> Result<Arc<dyn AgentConn>, WorkspaceError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Arc::new(self.conn.clone()))
    }
}

/// Creator returning a fixed result. Emits one build log line per call.
pub struct FakeCreator {
    result: CreateWorkspaceResult,
    last: Mutex<Option<(String, Value)>>,
}

impl FakeCreator {
    pub fn created(workspace_id: Uuid, agent_id: Option<Uuid>) -> Self {
        Self {
            result: CreateWorkspaceResult {
                created: true,
                workspace_id: Some(workspace_id),
                workspace_agent_id: agent_id,
                workspace_name: "dev".into(),
                ..Default::default()
            },
            last: Mutex::new(None),
        }
    }

    pub fn not_created(reason: &str) -> Self {
        Self {
            result: CreateWorkspaceResult {
                reason: reason.to_string(),
                ..Default::default()
            },
            last: Mutex::new(None),
        }
    }

    /// `(prompt, spec)` of the most recent request.
    pub fn last_request(&self) -> Option<(String, Value)> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkspaceCreator for FakeCreator {
    async fn create_workspace(
        &self,
        request: CreateWorkspaceRequest,
    ) -> Result<CreateWorkspaceResult, WorkspaceError> {
        if let Some(emit) = &request.build_log {
            emit(BuildLog {
                stage: "init".into(),
                level: "info".into(),
                output: "provisioning".into(),
            });
        }
        *self.last.lock().unwrap() = Some((request.prompt, request.spec));
        Ok(self.result.clone())
    }
}

// ── Context ─────────────────────────────────────────────────────────

pub struct NoopInterrupter;

impl Interrupter for NoopInterrupter {
    fn interrupt_chat(&self, _chat_id: Uuid) -> bool {
        false
    }
}

/// A tool context over an in-memory store with one top-level chat.
pub async fn test_context() -> ToolContext {
    let store: Arc<dyn ChatStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let chat = store
        .insert_chat(NewChat::new(Uuid::new_v4(), "root"))
        .await
        .unwrap();
    let subagents = Arc::new(SubagentService::new(
        Arc::clone(&store),
        Arc::new(NoopInterrupter),
        Duration::from_secs(5),
        Duration::from_millis(20),
    ));

    ToolContext {
        chat_id: chat.id,
        chat: Arc::new(tokio::sync::Mutex::new(chat)),
        model: Arc::new(ScriptedModel::default()),
        store,
        streams: StreamManager::new(),
        subagents,
        connections: Arc::new(WorkspaceConnCell::new()),
        agent_connector: None,
        workspace_creator: None,
        execute_timeout: Duration::from_secs(60),
        subagent_await_timeout: Duration::from_secs(5),
    }
}

//! End-to-end tests for the chat processor.
//!
//! Each test runs a real `Processor` over an in-memory libsql store with a
//! fake language model and workspace agent, then watches the store until
//! the chats settle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::{Value, json};
use tokio::time::timeout;
use uuid::Uuid;

use chatd::chat::content::{parse_tool_results, text_content};
use chatd::chat::model::{
    Chat, ChatMessage, ChatStatus, MessageRole, NewChat, NewChatMessage, TaskStatus, Workspace,
};
use chatd::config::ProcessorConfig;
use chatd::error::{LlmError, WorkspaceError};
use chatd::llm::{
    FinishReason, FixedModelResolver, LanguageModel, Message, MessagePart, ModelCall,
    ModelResponse, PartStream, Role, StreamPart,
};
use chatd::processor::{Processor, ProcessorDeps};
use chatd::store::{ChatStore, LibSqlBackend};
use chatd::stream::StreamManager;
use chatd::tools::workspace::{
    AgentConn, AgentConnector, CommandOutput, CommandSession, FileEdits,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Fakes ───────────────────────────────────────────────────────────

fn text_parts(text: &str) -> Vec<StreamPart> {
    vec![
        StreamPart::TextDelta(text.to_string()),
        StreamPart::Finish(FinishReason::Stop),
    ]
}

fn tool_parts(id: &str, name: &str, input: Value) -> Vec<StreamPart> {
    vec![
        StreamPart::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
        },
        StreamPart::Finish(FinishReason::ToolCalls),
    ]
}

/// Decides each response from the prompt it is given.
struct RuleModel {
    rule: Box<dyn Fn(&[Message]) -> Vec<StreamPart> + Send + Sync>,
}

impl RuleModel {
    fn new(rule: impl Fn(&[Message]) -> Vec<StreamPart> + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
        }
    }

    /// Replays `responses` in order, then answers with plain text.
    fn scripted(responses: Vec<Vec<StreamPart>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| text_parts("done"))
        })
    }
}

#[async_trait]
impl LanguageModel for RuleModel {
    fn provider(&self) -> &str {
        "rule"
    }

    fn model(&self) -> &str {
        "rule-1"
    }

    async fn generate(&self, _call: ModelCall) -> Result<ModelResponse, LlmError> {
        Err(LlmError::InvalidResponse {
            provider: "rule".into(),
            reason: "titles are not generated in these tests".into(),
        })
    }

    async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError> {
        let parts = (self.rule)(&call.prompt);
        Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
    }
}

/// First user text in a prompt.
fn first_user_text(prompt: &[Message]) -> String {
    prompt
        .iter()
        .find(|m| m.role == Role::User)
        .and_then(|m| {
            m.content.iter().find_map(|part| match part {
                MessagePart::Text { text } => Some(text.clone()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

#[derive(Clone, Default)]
struct FakeAgent {
    files: Arc<Mutex<std::collections::HashMap<String, Vec<u8>>>>,
    hang: bool,
}

struct FakeSession {
    hang: bool,
}

#[async_trait]
impl CommandSession for FakeSession {
    async fn combined_output(&self, command: &str) -> Result<CommandOutput, WorkspaceError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(CommandOutput {
            output: command.to_string(),
            exit_status: 0,
        })
    }
}

#[async_trait]
impl AgentConn for FakeAgent {
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

    async fn edit_files(&self, _files: &[FileEdits]) -> Result<(), WorkspaceError> {
        Ok(())
    }

    async fn command_session(&self) -> Result<Box<dyn CommandSession>, WorkspaceError> {
        Ok(Box::new(FakeSession { hang: self.hang }))
    }
}

struct FakeConnector(FakeAgent);

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self, _agent_id: Uuid) -> Result<Arc<dyn AgentConn>, WorkspaceError> {
        Ok(Arc::new(self.0.clone()))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        poll_interval: Duration::from_millis(20),
        subagent_poll_interval: Duration::from_millis(20),
        subagent_await_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn start_processor(model: RuleModel, agent: Option<FakeAgent>) -> Processor {
    let store: Arc<dyn ChatStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    Processor::new(
        fast_config(),
        ProcessorDeps {
            store,
            model_resolver: Arc::new(FixedModelResolver(Arc::new(model))),
            streams: StreamManager::new(),
            agent_connector: agent
                .map(|a| Arc::new(FakeConnector(a)) as Arc<dyn AgentConnector>),
            workspace_creator: None,
        },
    )
}

/// Insert a chat with one user message, then queue it.
async fn queue_chat(store: &dyn ChatStore, chat: NewChat, message: &str) -> Chat {
    let chat = store.insert_chat(chat).await.unwrap();
    store
        .insert_chat_message(NewChatMessage::new(
            chat.id,
            MessageRole::User,
            text_content(message),
        ))
        .await
        .unwrap();
    store
        .update_chat_status(chat.id, ChatStatus::Pending, None, None)
        .await
        .unwrap()
}

/// Poll the store until `chat_id` reaches `status` with no worker attached.
async fn wait_for_status(store: &dyn ChatStore, chat_id: Uuid, status: ChatStatus) -> Chat {
    loop {
        let chat = store.get_chat_by_id(chat_id).await.unwrap().unwrap();
        if chat.status == status && chat.worker_id.is_none() {
            return chat;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn tool_result_payloads(messages: &[ChatMessage]) -> Vec<(bool, Value)> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .flat_map(|m| parse_tool_results(m.content.as_ref()).unwrap())
        .map(|r| (r.is_error, r.result))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_file_run_persists_the_whole_turn() {
    timeout(TEST_TIMEOUT, async {
        let agent = FakeAgent::default();
        agent
            .files
            .lock()
            .unwrap()
            .insert("/a".into(), b"hello".to_vec());
        let model = RuleModel::scripted(vec![
            tool_parts("call-1", "read_file", json!({"path": "/a"})),
            text_parts("The file says hello."),
        ]);
        let processor = start_processor(model, Some(agent)).await;
        let store = processor.store().as_ref();

        let workspace = Workspace {
            id: Uuid::new_v4(),
            name: "dev".into(),
            deleted: false,
        };
        let agent_id = Uuid::new_v4();
        store.upsert_workspace(&workspace, &[agent_id]).await.unwrap();
        let chat = queue_chat(
            store,
            NewChat::new(Uuid::new_v4(), "read").with_workspace(workspace.id, Some(agent_id)),
            "read /a",
        )
        .await;

        wait_for_status(store, chat.id, ChatStatus::Waiting).await;
        let messages = store.get_chat_messages(chat.id).await.unwrap();
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call-1"));
        let results = tool_result_payloads(&messages);
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
        assert_eq!(results[0].1["content"], "hello");

        processor.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_execute_timeout_is_a_tool_error_and_the_chat_continues() {
    timeout(TEST_TIMEOUT, async {
        let agent = FakeAgent {
            hang: true,
            ..Default::default()
        };
        let model = RuleModel::scripted(vec![
            tool_parts(
                "call-1",
                "execute",
                json!({"command": "sleep 100", "timeout_seconds": 1}),
            ),
            text_parts("That command hung."),
        ]);
        let processor = start_processor(model, Some(agent)).await;
        let store = processor.store().as_ref();

        let workspace = Workspace {
            id: Uuid::new_v4(),
            name: "dev".into(),
            deleted: false,
        };
        let agent_id = Uuid::new_v4();
        store.upsert_workspace(&workspace, &[agent_id]).await.unwrap();
        let chat = queue_chat(
            store,
            NewChat::new(Uuid::new_v4(), "exec").with_workspace(workspace.id, Some(agent_id)),
            "run it",
        )
        .await;

        let settled = wait_for_status(store, chat.id, ChatStatus::Waiting).await;
        assert_eq!(settled.status, ChatStatus::Waiting);

        let messages = store.get_chat_messages(chat.id).await.unwrap();
        let results = tool_result_payloads(&messages);
        assert_eq!(results.len(), 1);
        let (is_error, payload) = &results[0];
        assert!(is_error);
        assert_eq!(payload["exit_code"], 0);
        assert!(payload["error"].as_str().is_some_and(|e| e.contains("deadline")));
        assert_eq!(messages.last().unwrap().role, MessageRole::Assistant);

        processor.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_parent_awaits_report_from_delegated_child() {
    timeout(TEST_TIMEOUT, async {
        let model = RuleModel::new(|prompt| {
            if prompt.last().is_some_and(|m| m.role == Role::Tool) {
                return text_parts("finished");
            }
            let first = first_user_text(prompt);
            if first.contains("delegate") {
                tool_parts(
                    "spawn-1",
                    "subagent",
                    json!({"prompt": "count the files", "title": "Counter", "background": false}),
                )
            } else if first.contains("count the files") {
                tool_parts("report-1", "subagent_report", json!({"report": "42 files"}))
            } else {
                text_parts("hello")
            }
        });
        let processor = start_processor(model, None).await;
        let store = processor.store().as_ref();

        let parent = queue_chat(
            store,
            NewChat::new(Uuid::new_v4(), "parent"),
            "please delegate the counting",
        )
        .await;

        wait_for_status(store, parent.id, ChatStatus::Waiting).await;

        let children = store.list_child_chats(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        let child = wait_for_status(store, children[0].id, ChatStatus::Waiting).await;
        assert_eq!(child.title, "Counter");
        assert_eq!(child.root_chat_id, Some(parent.id));
        assert_eq!(child.task_status, Some(TaskStatus::Reported));
        assert_eq!(child.task_report.as_deref(), Some("42 files"));

        let messages = store.get_chat_messages(parent.id).await.unwrap();
        let spawn = tool_result_payloads(&messages)
            .into_iter()
            .map(|(_, payload)| payload)
            .find(|payload| payload["status"] == "completed")
            .expect("subagent tool result");
        assert_eq!(spawn["report"], "42 files");
        assert_eq!(spawn["chat_id"], child.id.to_string());

        processor.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_close_keeps_settled_chat_status() {
    timeout(TEST_TIMEOUT, async {
        let processor = start_processor(RuleModel::scripted(vec![]), None).await;
        let store = processor.store().as_ref();
        let chat = queue_chat(store, NewChat::new(Uuid::new_v4(), "hi"), "hi").await;

        let settled = wait_for_status(store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;

        let after = store.get_chat_by_id(chat.id).await.unwrap().unwrap();
        assert_eq!(after.status, settled.status);
        assert!(!processor.is_running(chat.id));
    })
    .await
    .expect("test timed out");
}

//! Chat job processor.
//!
//! A single poll loop claims pending chats from the store and runs each one
//! on its own task. The store claim is the only thing keeping two workers
//! off the same chat; this module just tracks what it owns so runs can be
//! interrupted and drained on close.
//!
//! Final status of a run:
//! - clean finish: `Waiting` (delegated children may instead be requeued as
//!   `Pending` for a report-only pass)
//! - interrupted: `Waiting`, no error event
//! - shutdown: `Pending`, claim released for another worker
//! - failure or panic: `Error`, with one error event

pub mod active;
pub mod prompt;
mod run;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use uuid::Uuid;

use crate::chat::model::ChatStatus;
use crate::config::ProcessorConfig;
use crate::llm::ModelResolver;
use crate::store::ChatStore;
use crate::stream::StreamManager;
use crate::subagent::{Interrupter, SubagentService};
use crate::tools::workspace::{AgentConnector, WorkspaceCreator};
use crate::tools::{ToolRegistry, chat_tools};

pub use active::{ActiveChats, CancelCause};

/// External collaborators of a processor.
pub struct ProcessorDeps {
    pub store: Arc<dyn ChatStore>,
    pub model_resolver: Arc<dyn ModelResolver>,
    pub streams: StreamManager,
    pub agent_connector: Option<Arc<dyn AgentConnector>>,
    pub workspace_creator: Option<Arc<dyn WorkspaceCreator>>,
}

pub(crate) struct ProcessorInner {
    config: ProcessorConfig,
    worker_id: Uuid,
    store: Arc<dyn ChatStore>,
    model_resolver: Arc<dyn ModelResolver>,
    streams: StreamManager,
    active: Arc<ActiveChats>,
    subagents: Arc<SubagentService>,
    tools: Arc<ToolRegistry>,
    agent_connector: Option<Arc<dyn AgentConnector>>,
    workspace_creator: Option<Arc<dyn WorkspaceCreator>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Claims and runs chats until closed.
pub struct Processor {
    inner: Arc<ProcessorInner>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    /// Build the processor and start its poll loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ProcessorConfig, deps: ProcessorDeps) -> Self {
        let active = Arc::new(ActiveChats::new(deps.streams.clone()));
        let interrupter: Arc<dyn Interrupter> = active.clone();
        let subagents = Arc::new(SubagentService::new(
            Arc::clone(&deps.store),
            interrupter,
            config.subagent_await_timeout,
            config.subagent_poll_interval,
        ));

        let inner = Arc::new(ProcessorInner {
            worker_id: Uuid::new_v4(),
            store: deps.store,
            model_resolver: deps.model_resolver,
            streams: deps.streams,
            active,
            subagents,
            tools: Arc::new(chat_tools()),
            agent_connector: deps.agent_connector,
            workspace_creator: deps.workspace_creator,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        });

        info!(
            worker_id = %inner.worker_id,
            poll_interval_ms = inner.config.poll_interval.as_millis() as u64,
            "Chat processor started"
        );
        let poll = tokio::spawn(poll_loop(Arc::clone(&inner)));
        Self {
            inner,
            poll: Mutex::new(Some(poll)),
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.inner.worker_id
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.inner.store
    }

    pub fn streams(&self) -> &StreamManager {
        &self.inner.streams
    }

    pub fn subagents(&self) -> &Arc<SubagentService> {
        &self.inner.subagents
    }

    /// Whether `chat_id` is running under this processor.
    pub fn is_running(&self, chat_id: Uuid) -> bool {
        self.inner.active.is_active(chat_id)
    }

    /// Interrupt a chat running under this processor.
    ///
    /// Returns false, without side effects, when it is not running here.
    pub fn interrupt_chat(&self, chat_id: Uuid) -> bool {
        self.inner.active.interrupt(chat_id)
    }

    /// Stop polling and wait for every in-flight run to be released.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let poll = self.poll.lock().expect("poll handle poisoned").take();
        if let Some(poll) = poll
            && let Err(e) = poll.await
        {
            error!(error = %e, "Chat poll loop ended abnormally");
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(worker_id = %self.inner.worker_id, "Chat processor stopped");
    }
}

async fn poll_loop(inner: Arc<ProcessorInner>) {
    inner.recover_stale_chats().await;

    let mut tick = tokio::time::interval(inner.config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tick.tick() => inner.process_once().await,
        }
    }
}

impl ProcessorInner {
    /// Reset chats whose claim is older than the stale threshold.
    async fn recover_stale_chats(&self) {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let before = Utc::now() - threshold;

        let stale = match self.store.get_stale_chats(before).await {
            Ok(chats) => chats,
            Err(e) => {
                error!(error = %e, "Failed to get stale chats");
                return;
            }
        };

        for chat in &stale {
            info!(chat_id = %chat.id, "Recovering stale chat");
            if let Err(e) = self
                .store
                .update_chat_status(chat.id, ChatStatus::Pending, None, None)
                .await
            {
                error!(chat_id = %chat.id, error = %e, "Failed to recover stale chat");
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Recovered stale chats");
        }
    }

    /// Claim at most one pending chat and start it without waiting.
    async fn process_once(self: &Arc<Self>) {
        let chat = match self.store.acquire_chat(self.worker_id, Utc::now()).await {
            Ok(Some(chat)) => chat,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to acquire chat");
                return;
            }
        };

        let inner = Arc::clone(self);
        self.tracker.spawn(async move { inner.process_chat(chat).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::chat::content::{parse_tool_results, text_content};
    use crate::chat::model::{Chat, MessageRole, NewChat, NewChatMessage, TaskStatus};
    use crate::error::LlmError;
    use crate::llm::{
        FixedModelResolver, LanguageModel, ModelCall, ModelResponse, PartStream, Role,
    };
    use crate::store::LibSqlBackend;
    use crate::stream::StreamPayload;
    use crate::testing::{
        FakeAgentConn, FakeConnector, ScriptedModel, text_response, tool_response,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            poll_interval: Duration::from_millis(10),
            subagent_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn memory_store() -> Arc<dyn ChatStore> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn processor_with(
        store: &Arc<dyn ChatStore>,
        model: Arc<dyn LanguageModel>,
        config: ProcessorConfig,
        connector: Option<Arc<dyn AgentConnector>>,
    ) -> Processor {
        Processor::new(
            config,
            ProcessorDeps {
                store: Arc::clone(store),
                model_resolver: Arc::new(FixedModelResolver(model)),
                streams: StreamManager::new(),
                agent_connector: connector,
                workspace_creator: None,
            },
        )
    }

    async fn queue_chat(store: &Arc<dyn ChatStore>, text: &str) -> Chat {
        let chat = store
            .insert_chat(NewChat::new(Uuid::new_v4(), "").with_status(ChatStatus::Pending))
            .await
            .unwrap();
        store
            .insert_chat_message(NewChatMessage::new(
                chat.id,
                MessageRole::User,
                text_content(text),
            ))
            .await
            .unwrap();
        chat
    }

    async fn wait_for_status(store: &Arc<dyn ChatStore>, chat_id: Uuid, status: ChatStatus) -> Chat {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let chat = store.get_chat_by_id(chat_id).await.unwrap().unwrap();
                if chat.status == status {
                    return chat;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("chat never reached expected status")
    }

    /// Blocks in `stream` until its run is cancelled.
    #[derive(Default)]
    struct HangingModel {
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl LanguageModel for HangingModel {
        fn provider(&self) -> &str {
            "hanging"
        }
        fn model(&self) -> &str {
            "hanging-1"
        }
        async fn generate(&self, _call: ModelCall) -> Result<ModelResponse, LlmError> {
            Err(LlmError::UnsupportedModel("no titles".into()))
        }
        async fn stream(&self, _call: ModelCall) -> Result<PartStream, LlmError> {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    /// Panics on its first stream call, then behaves.
    #[derive(Default)]
    struct PanickingModel {
        panicked: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LanguageModel for PanickingModel {
        fn provider(&self) -> &str {
            "panicking"
        }
        fn model(&self) -> &str {
            "panicking-1"
        }
        async fn generate(&self, _call: ModelCall) -> Result<ModelResponse, LlmError> {
            Err(LlmError::UnsupportedModel("no titles".into()))
        }
        async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError> {
            if !self.panicked.swap(true, std::sync::atomic::Ordering::SeqCst) {
                panic!("model exploded");
            }
            ScriptedModel::default().stream(call).await
        }
    }

    #[tokio::test]
    async fn read_file_run_persists_four_messages_and_waits() {
        let store = memory_store().await;
        let workspace_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        store
            .upsert_workspace(
                &crate::chat::model::Workspace {
                    id: workspace_id,
                    name: "dev".into(),
                    deleted: false,
                },
                &[agent_id],
            )
            .await
            .unwrap();
        let chat = store
            .insert_chat(
                NewChat::new(Uuid::new_v4(), "")
                    .with_status(ChatStatus::Pending)
                    .with_workspace(workspace_id, Some(agent_id)),
            )
            .await
            .unwrap();
        store
            .insert_chat_message(NewChatMessage::new(
                chat.id,
                MessageRole::User,
                text_content("read file X"),
            ))
            .await
            .unwrap();

        let conn = FakeAgentConn::default();
        conn.files.lock().unwrap().insert("X".into(), b"hello".to_vec());
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response("call_1", "read_file", r#"{"path":"X"}"#),
            text_response("It says hello."),
        ]));
        let processor = processor_with(
            &store,
            model.clone(),
            fast_config(),
            Some(Arc::new(FakeConnector::new(conn))),
        );

        wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;

        let messages = store.get_chat_messages(chat.id).await.unwrap();
        let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
        let results = parse_tool_results(messages[2].content.as_ref()).unwrap();
        assert!(!results[0].is_error);
        assert_eq!(results[0].result["content"], "hello");

        let released = store.get_chat_by_id(chat.id).await.unwrap().unwrap();
        assert!(released.worker_id.is_none() && released.started_at.is_none());

        // Workspace is linked, so no create_workspace instruction.
        let first = &model.calls.lock().unwrap()[0];
        assert_eq!(first.prompt[0].role, Role::User);
    }

    #[tokio::test]
    async fn chat_without_workspace_gets_instruction() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "hello").await;
        let model = Arc::new(ScriptedModel::new(vec![text_response("hi")]));
        let processor = processor_with(&store, model.clone(), fast_config(), None);

        wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;

        let call = model.last_call();
        assert_eq!(call.prompt[0].role, Role::System);
        assert_eq!(
            call.prompt[0].single_text(),
            Some(prompt::NO_WORKSPACE_INSTRUCTION)
        );
    }

    #[tokio::test]
    async fn deleted_workspace_linkage_is_cleared() {
        let store = memory_store().await;
        let workspace_id = Uuid::new_v4();
        store
            .upsert_workspace(
                &crate::chat::model::Workspace {
                    id: workspace_id,
                    name: "gone".into(),
                    deleted: true,
                },
                &[],
            )
            .await
            .unwrap();
        let chat = store
            .insert_chat(
                NewChat::new(Uuid::new_v4(), "")
                    .with_status(ChatStatus::Pending)
                    .with_workspace(workspace_id, None),
            )
            .await
            .unwrap();
        let model = Arc::new(ScriptedModel::new(vec![text_response("ok")]));
        let processor = processor_with(&store, model, fast_config(), None);

        let chat = wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;
        assert!(chat.workspace_id.is_none());
        assert!(chat.workspace_agent_id.is_none());
    }

    #[tokio::test]
    async fn generated_title_replaces_empty_title() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "please fix the login bug").await;
        let model = Arc::new(ScriptedModel::new(vec![text_response("sure")]));
        *model.title.lock().unwrap() = Some("\"Fix login bug\"".into());
        let processor = processor_with(&store, model, fast_config(), None);

        let chat = wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;
        assert_eq!(chat.title, "Fix login bug");
    }

    #[tokio::test]
    async fn interrupt_returns_chat_to_waiting_without_error() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "hang").await;
        let model = Arc::new(HangingModel::default());
        let processor = processor_with(&store, model.clone(), fast_config(), None);
        let (_, mut rx, _guard) = processor.streams().subscribe(chat.id);

        tokio::time::timeout(TEST_TIMEOUT, model.started.notified())
            .await
            .unwrap();
        assert!(!processor.interrupt_chat(Uuid::new_v4()));
        assert!(processor.interrupt_chat(chat.id));

        wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;
        assert!(!processor.is_running(chat.id));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event.payload {
                StreamPayload::Error { message } => panic!("unexpected error event: {message}"),
                StreamPayload::Status { status } => statuses.push(status),
                _ => {}
            }
        }
        assert_eq!(statuses, vec![ChatStatus::Running, ChatStatus::Waiting]);
    }

    #[tokio::test]
    async fn panic_is_contained_and_loop_keeps_going() {
        let store = memory_store().await;
        let first = queue_chat(&store, "one").await;
        let model = Arc::new(PanickingModel::default());
        let processor = processor_with(&store, model, fast_config(), None);
        let (_, mut rx, _guard) = processor.streams().subscribe(first.id);

        wait_for_status(&store, first.id, ChatStatus::Error).await;
        let second = queue_chat(&store, "two").await;
        wait_for_status(&store, second.id, ChatStatus::Waiting).await;
        processor.close().await;

        let errors: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e.payload {
                StreamPayload::Error { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["chat processing panicked: model exploded".to_string()]);
    }

    #[tokio::test]
    async fn step_ceiling_with_pending_tool_calls_is_an_error() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "loop").await;
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response("c1", "unknown_tool", "{}"),
            tool_response("c2", "unknown_tool", "{}"),
        ]));
        let config = ProcessorConfig {
            max_chat_steps: 2,
            ..fast_config()
        };
        let processor = processor_with(&store, model, config, None);
        let (_, mut rx, _guard) = processor.streams().subscribe(chat.id);

        wait_for_status(&store, chat.id, ChatStatus::Error).await;
        processor.close().await;

        let errors: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e.payload {
                StreamPayload::Error { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["chat exceeded 2 tool steps".to_string()]);
    }

    #[tokio::test]
    async fn stale_claims_are_recovered_at_startup() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "stale").await;
        let old_worker = Uuid::new_v4();
        let claimed = store
            .acquire_chat(old_worker, Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, chat.id);

        let model = Arc::new(ScriptedModel::new(vec![text_response("back")]));
        let config = ProcessorConfig {
            stale_threshold: Duration::from_secs(60),
            ..fast_config()
        };
        let processor = processor_with(&store, model.clone(), config, None);

        let chat = wait_for_status(&store, chat.id, ChatStatus::Waiting).await;
        processor.close().await;
        assert_eq!(model.call_count(), 1);
        assert!(chat.worker_id.is_none());
    }

    #[tokio::test]
    async fn close_releases_running_chats_as_pending() {
        let store = memory_store().await;
        let chat = queue_chat(&store, "hang").await;
        let model = Arc::new(HangingModel::default());
        let processor = processor_with(&store, model.clone(), fast_config(), None);

        tokio::time::timeout(TEST_TIMEOUT, model.started.notified())
            .await
            .unwrap();
        tokio::time::timeout(TEST_TIMEOUT, processor.close())
            .await
            .unwrap();

        let chat = store.get_chat_by_id(chat.id).await.unwrap().unwrap();
        assert_eq!(chat.status, ChatStatus::Pending);
        assert!(chat.worker_id.is_none());
    }

    #[tokio::test]
    async fn silent_child_gets_report_only_pass_then_fallback() {
        let store = memory_store().await;
        // A running parent is not requeued by the child's report.
        let parent = store
            .insert_chat(NewChat::new(Uuid::new_v4(), "parent").with_status(ChatStatus::Running))
            .await
            .unwrap();
        // Both passes answer with text only, never calling subagent_report.
        let model = Arc::new(ScriptedModel::new(vec![
            text_response("I looked around."),
            text_response("All done here."),
        ]));
        let processor = processor_with(&store, model.clone(), fast_config(), None);
        let (child, request_id) = processor
            .subagents()
            .create_child(&parent, "look around", None)
            .await
            .unwrap();

        let result = tokio::time::timeout(
            TEST_TIMEOUT,
            processor.subagents().await_report(
                parent.id,
                child.id,
                request_id,
                TEST_TIMEOUT,
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.report, "All done here.");
        wait_for_status(&store, child.id, ChatStatus::Waiting).await;
        processor.close().await;

        // The second pass only offered the report tool.
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let offered: Vec<&str> = calls[1].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec!["subagent_report"]);
        assert_eq!(
            calls[1].prompt.last().and_then(|m| m.single_text()),
            Some(prompt::REPORT_ONLY_INSTRUCTION)
        );
        drop(calls);

        let child = store.get_chat_by_id(child.id).await.unwrap().unwrap();
        assert_eq!(child.task_status, Some(TaskStatus::Reported));

        // Both passes' assistant turns are tied to the request they served.
        let messages = store.get_chat_messages(child.id).await.unwrap();
        let assistant: Vec<_> = messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .collect();
        assert_eq!(assistant.len(), 2);
        assert!(assistant.iter().all(|m| m.subagent_request_id == Some(request_id)));
        assert!(assistant.iter().all(|m| m.subagent_event.is_none()));
    }

    /// Holds its first `stream` call until the test opens the gate.
    struct GatedModel {
        inner: ScriptedModel,
        started: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl LanguageModel for GatedModel {
        fn provider(&self) -> &str {
            "gated"
        }
        fn model(&self) -> &str {
            "gated-1"
        }
        async fn generate(&self, call: ModelCall) -> Result<ModelResponse, LlmError> {
            self.inner.generate(call).await
        }
        async fn stream(&self, call: ModelCall) -> Result<PartStream, LlmError> {
            if self.inner.call_count() == 0 {
                self.started.notify_one();
                let _permit = self.gate.acquire().await;
            }
            self.inner.stream(call).await
        }
    }

    #[tokio::test]
    async fn request_sent_during_run_gets_full_pass() {
        let store = memory_store().await;
        let parent = store
            .insert_chat(NewChat::new(Uuid::new_v4(), "parent").with_status(ChatStatus::Running))
            .await
            .unwrap();
        let model = Arc::new(GatedModel {
            inner: ScriptedModel::new(vec![
                text_response("Counted the files."),
                tool_response("r2", "subagent_report", &json!({"report": "tests pass"}).to_string()),
                text_response("reported"),
                text_response("There are 42 files."),
            ]),
            started: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let processor = processor_with(&store, model.clone(), fast_config(), None);
        let subagents = processor.subagents();
        let (child, first) = subagents
            .create_child(&parent, "count the files", None)
            .await
            .unwrap();

        tokio::time::timeout(TEST_TIMEOUT, model.started.notified())
            .await
            .unwrap();
        let (_, second) = subagents
            .send_message(parent.id, child.id, "run the tests")
            .await
            .unwrap();
        model.gate.add_permits(1);

        let result = subagents
            .await_report(parent.id, child.id, second, TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.report, "tests pass");

        // The first request was worked on already and only owes a report.
        let result = subagents
            .await_report(parent.id, child.id, first, TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.report, "There are 42 files.");
        wait_for_status(&store, child.id, ChatStatus::Waiting).await;
        processor.close().await;

        let calls = model.inner.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let offered = |i: usize| -> Vec<String> {
            calls[i].tools.iter().map(|t| t.name.clone()).collect()
        };
        assert!(offered(1).len() > 1);
        assert!(offered(1).iter().any(|name| name == "execute"));
        assert_ne!(
            calls[1].prompt.last().and_then(|m| m.single_text()),
            Some(prompt::REPORT_ONLY_INSTRUCTION)
        );
        assert_eq!(offered(3), vec!["subagent_report".to_string()]);
        drop(calls);

        let child = store.get_chat_by_id(child.id).await.unwrap().unwrap();
        assert_eq!(child.task_status, Some(TaskStatus::Reported));
    }

    #[tokio::test]
    async fn child_that_reports_finishes_in_one_pass() {
        let store = memory_store().await;
        // A running parent is not requeued by the child's report.
        let parent = store
            .insert_chat(NewChat::new(Uuid::new_v4(), "parent").with_status(ChatStatus::Running))
            .await
            .unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            tool_response("r1", "subagent_report", &json!({"report": "found it"}).to_string()),
            text_response("reported"),
        ]));
        let processor = processor_with(&store, model.clone(), fast_config(), None);
        let (child, request_id) = processor
            .subagents()
            .create_child(&parent, "find it", None)
            .await
            .unwrap();

        let result = processor
            .subagents()
            .await_report(parent.id, child.id, request_id, TEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.report, "found it");
        wait_for_status(&store, child.id, ChatStatus::Waiting).await;
        processor.close().await;
        assert_eq!(model.call_count(), 2);
    }
}

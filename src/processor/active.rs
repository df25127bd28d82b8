//! Registry of chats running in this process, keyed by chat id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::stream::StreamManager;
use crate::subagent::Interrupter;

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// A user or the delegation service stopped the chat.
    Interrupted,
    /// The processor is closing.
    Shutdown,
}

/// Cancellation handle of one run.
#[derive(Clone)]
pub struct RunHandle {
    pub token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl RunHandle {
    /// Cause of the cancellation. Only meaningful once the token fired; a
    /// token cancelled through its parent carries no explicit cause.
    pub fn cause(&self) -> CancelCause {
        self.cause.get().copied().unwrap_or(CancelCause::Shutdown)
    }

    /// Cancel with `cause`. The first cause recorded wins.
    pub fn cancel(&self, cause: CancelCause) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }
}

/// Chats currently executing under this processor.
pub struct ActiveChats {
    runs: Mutex<HashMap<Uuid, RunHandle>>,
    streams: StreamManager,
}

impl ActiveChats {
    pub fn new(streams: StreamManager) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            streams,
        }
    }

    /// Register a run whose token is a child of `shutdown`.
    pub fn register(&self, chat_id: Uuid, shutdown: &CancellationToken) -> RunHandle {
        let handle = RunHandle {
            token: shutdown.child_token(),
            cause: Arc::new(OnceLock::new()),
        };
        self.runs
            .lock()
            .expect("active chats poisoned")
            .insert(chat_id, handle.clone());
        handle
    }

    /// Remove `handle`'s run. A newer run registered for the same chat is
    /// left in place.
    pub fn unregister(&self, chat_id: Uuid, handle: &RunHandle) {
        let mut runs = self.runs.lock().expect("active chats poisoned");
        if runs
            .get(&chat_id)
            .is_some_and(|current| Arc::ptr_eq(&current.cause, &handle.cause))
        {
            runs.remove(&chat_id);
        }
    }

    pub fn is_active(&self, chat_id: Uuid) -> bool {
        self.runs
            .lock()
            .expect("active chats poisoned")
            .contains_key(&chat_id)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().expect("active chats poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interrupt a running chat and stop buffering its stream.
    ///
    /// Returns false when the chat is not running here.
    pub fn interrupt(&self, chat_id: Uuid) -> bool {
        let handle = self
            .runs
            .lock()
            .expect("active chats poisoned")
            .get(&chat_id)
            .cloned();
        let Some(handle) = handle else {
            return false;
        };

        handle.cancel(CancelCause::Interrupted);
        self.streams.stop_stream(chat_id);
        info!(chat_id = %chat_id, "Interrupted chat");
        true
    }
}

impl Interrupter for ActiveChats {
    fn interrupt_chat(&self, chat_id: Uuid) -> bool {
        self.interrupt(chat_id)
    }
}

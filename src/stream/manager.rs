//! Per-chat pub/sub with replay buffering for late subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use super::event::StreamEvent;

/// Capacity of each subscriber channel. Events beyond it are dropped.
pub const SUBSCRIBER_BUFFER: usize = 128;

#[derive(Default)]
struct ChatStreamState {
    buffer: Vec<StreamEvent>,
    buffering: bool,
    subscribers: HashMap<Uuid, mpsc::Sender<StreamEvent>>,
}

type Registry = Arc<Mutex<HashMap<Uuid, ChatStreamState>>>;

/// Broadcasts in-flight chat events to any number of subscribers.
///
/// Publishing never blocks: a subscriber whose channel is full loses the
/// event.
#[derive(Clone, Default)]
pub struct StreamManager {
    chats: Registry,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering message parts for `chat_id`, discarding any old buffer.
    pub fn start_stream(&self, chat_id: Uuid) {
        let mut chats = self.chats.lock().expect("stream registry poisoned");
        let state = chats.entry(chat_id).or_default();
        state.buffer.clear();
        state.buffering = true;
    }

    /// Stop buffering for `chat_id` and drop the buffer.
    pub fn stop_stream(&self, chat_id: Uuid) {
        let mut chats = self.chats.lock().expect("stream registry poisoned");
        if let Some(state) = chats.get_mut(&chat_id) {
            state.buffer.clear();
            state.buffering = false;
            if state.subscribers.is_empty() {
                chats.remove(&chat_id);
            }
        }
    }

    pub fn publish(&self, chat_id: Uuid, event: StreamEvent) {
        let subscribers: Vec<mpsc::Sender<StreamEvent>> = {
            let mut chats = self.chats.lock().expect("stream registry poisoned");
            let Some(state) = chats.get_mut(&chat_id) else {
                return;
            };
            if state.buffering && event.is_message_part() {
                state.buffer.push(event.clone());
            }
            state.subscribers.values().cloned().collect()
        };

        for tx in subscribers {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event.clone()) {
                warn!(chat_id = %chat_id, event_type = dropped.kind(), "Dropping chat stream event");
            }
        }
    }

    /// Subscribe to a chat.
    ///
    /// Returns the buffered message parts so far plus a channel of live
    /// events. The subscription ends when the returned guard is dropped.
    pub fn subscribe(
        &self,
        chat_id: Uuid,
    ) -> (Vec<StreamEvent>, mpsc::Receiver<StreamEvent>, Unsubscribe) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        let snapshot = {
            let mut chats = self.chats.lock().expect("stream registry poisoned");
            let state = chats.entry(chat_id).or_default();
            state.subscribers.insert(id, tx);
            state.buffer.clone()
        };

        let guard = Unsubscribe {
            chats: Arc::clone(&self.chats),
            chat_id,
            id,
        };
        (snapshot, rx, guard)
    }

    /// Number of live subscribers of a chat.
    pub fn subscriber_count(&self, chat_id: Uuid) -> usize {
        let chats = self.chats.lock().expect("stream registry poisoned");
        chats.get(&chat_id).map_or(0, |s| s.subscribers.len())
    }
}

/// Removes a subscriber when dropped. Its channel closes once the last
/// sender clone held by an in-progress publish goes away.
pub struct Unsubscribe {
    chats: Registry,
    chat_id: Uuid,
    id: Uuid,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {}
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        let mut chats = self.chats.lock().expect("stream registry poisoned");
        if let Some(state) = chats.get_mut(&self.chat_id) {
            state.subscribers.remove(&self.id);
            if state.subscribers.is_empty() && !state.buffering {
                chats.remove(&self.chat_id);
            }
        }
    }
}

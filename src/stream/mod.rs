//! Live event fan-out for running chats.

pub mod event;
pub mod manager;

pub use event::{MessagePart, PartKind, StreamEvent, StreamPayload};
pub use manager::{StreamManager, Unsubscribe};

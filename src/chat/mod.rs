//! Chat records, message content and titles.

pub mod content;
pub mod model;
pub mod title;

pub use content::{ContentBlock, ToolResultBlock};
pub use model::{
    Chat, ChatMessage, ChatStatus, MessageRole, NewChat, NewChatMessage, SubagentEvent,
    TaskStatus, Workspace,
};

//! Stream event wire types.
//!
//! Every event carries the chat id and a `type`-tagged payload:
//!
//! ```json
//! {"chat_id": "...", "type": "message_part", "role": "assistant", "part": {"type": "text", "text": "Hi"}}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::content::ToolResultBlock;
use crate::chat::model::{ChatMessage, ChatStatus, MessageRole};

/// One transient broadcast unit for a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub chat_id: Uuid,
    #[serde(flatten)]
    pub payload: StreamPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    Status { status: ChatStatus },
    Message { message: ChatMessage },
    MessagePart { role: MessageRole, part: MessagePart },
    Error { message: String },
}

impl StreamEvent {
    pub fn status(chat_id: Uuid, status: ChatStatus) -> Self {
        Self {
            chat_id,
            payload: StreamPayload::Status { status },
        }
    }

    pub fn message(chat_id: Uuid, message: ChatMessage) -> Self {
        Self {
            chat_id,
            payload: StreamPayload::Message { message },
        }
    }

    pub fn message_part(chat_id: Uuid, role: MessageRole, part: MessagePart) -> Self {
        Self {
            chat_id,
            payload: StreamPayload::MessagePart { role, part },
        }
    }

    pub fn error(chat_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            chat_id,
            payload: StreamPayload::Error {
                message: message.into(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            StreamPayload::Status { .. } => "status",
            StreamPayload::Message { .. } => "message",
            StreamPayload::MessagePart { .. } => "message_part",
            StreamPayload::Error { .. } => "error",
        }
    }

    /// Only message-part deltas are replayed to late subscribers.
    pub fn is_message_part(&self) -> bool {
        matches!(self.payload, StreamPayload::MessagePart { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Reasoning,
    ToolCall,
    ToolResult,
    Source,
    File,
}

/// A streamed fragment of a message being produced.
///
/// Only the fields relevant to `kind` are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_delta: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl MessagePart {
    fn empty(kind: PartKind) -> Self {
        Self {
            kind,
            text: None,
            tool_call_id: None,
            tool_name: None,
            args: None,
            args_delta: None,
            result: None,
            result_delta: None,
            is_error: false,
            source_id: None,
            url: None,
            title: None,
            media_type: None,
            data: None,
        }
    }

    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self {
            text: Some(delta.into()),
            ..Self::empty(PartKind::Text)
        }
    }

    pub fn reasoning_delta(delta: impl Into<String>) -> Self {
        Self {
            text: Some(delta.into()),
            ..Self::empty(PartKind::Reasoning)
        }
    }

    pub fn tool_call_delta(id: &str, name: &str, args_delta: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(id.to_string()),
            tool_name: Some(name.to_string()),
            args_delta: Some(args_delta.into()),
            ..Self::empty(PartKind::ToolCall)
        }
    }

    pub fn tool_call(id: &str, name: &str, args: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(id.to_string()),
            tool_name: Some(name.to_string()),
            args: Some(args.into()),
            ..Self::empty(PartKind::ToolCall)
        }
    }

    pub fn tool_result(result: &ToolResultBlock) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            tool_name: Some(result.tool_name.clone()),
            result: Some(result.result.clone()),
            is_error: result.is_error,
            ..Self::empty(PartKind::ToolResult)
        }
    }

    pub fn tool_result_delta(id: &str, name: &str, delta: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(id.to_string()),
            tool_name: Some(name.to_string()),
            result_delta: Some(delta.into()),
            ..Self::empty(PartKind::ToolResult)
        }
    }

    pub fn source(id: &str, url: &str, title: Option<&str>) -> Self {
        Self {
            source_id: Some(id.to_string()),
            url: Some(url.to_string()),
            title: title.map(str::to_string),
            ..Self::empty(PartKind::Source)
        }
    }
}

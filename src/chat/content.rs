//! Persisted message content blocks and their JSON encodings.
//!
//! Encoding by role:
//! - `system`: a JSON string
//! - `user`: a JSON string or an array of [`ContentBlock`]
//! - `assistant` and the marker roles: an array of [`ContentBlock`]
//! - `tool`: an array of [`ToolResultBlock`]

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::chat::model::MessageRole;

/// One block of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        /// Raw JSON arguments as produced by the model.
        input: String,
    },
    ToolResult(ToolResultBlock),
    File {
        media_type: String,
        data: String,
    },
    Source {
        id: String,
        url: String,
        #[serde(default)]
        title: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Uniform tool result shape shared by every tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResultBlock {
    /// An empty, successful result for the given call.
    pub fn base(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            result: Value::Null,
            is_error: false,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    /// Turn this result into an error result carrying `{"error": message}`.
    pub fn error(mut self, message: impl std::fmt::Display) -> Self {
        self.is_error = true;
        self.result = json!({ "error": message.to_string() });
        self
    }

    /// Text the model sees for this result.
    ///
    /// Error results surface the extracted `error` string when present.
    pub fn output_text(&self) -> String {
        if self.is_error {
            return tool_result_error_message(&self.result);
        }
        let payload = if self.result.is_null() {
            json!({})
        } else {
            self.result.clone()
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Extract the `error` field of a tool payload, else the payload as JSON.
pub fn tool_result_error_message(payload: &Value) -> String {
    if let Some(message) = payload.get("error").and_then(Value::as_str)
        && !message.trim().is_empty()
    {
        return message.to_string();
    }
    if payload.is_null() {
        return "{}".to_string();
    }
    serde_json::to_string(payload)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Decode `system` content.
pub fn parse_system_content(raw: Option<&Value>) -> Result<String, String> {
    match raw {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!(
            "parse system message content: expected string, got {other}"
        )),
    }
}

/// Decode user, assistant or marker content into blocks.
pub fn parse_content_blocks(role: MessageRole, raw: Option<&Value>) -> Result<Vec<ContentBlock>, String> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(text)) => Ok(vec![ContentBlock::text(text.clone())]),
        Some(value @ Value::Array(_)) => serde_json::from_value(value.clone())
            .map_err(|e| format!("parse {role} content: {e}")),
        Some(other) => Err(format!("parse {role} content: unexpected {other}")),
    }
}

/// Decode `tool` content.
pub fn parse_tool_results(raw: Option<&Value>) -> Result<Vec<ToolResultBlock>, String> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|e| format!("parse tool content: {e}"))
        }
    }
}

pub fn marshal_content_blocks(blocks: &[ContentBlock]) -> Value {
    serde_json::to_value(blocks).unwrap_or_else(|_| Value::Array(Vec::new()))
}

pub fn marshal_tool_results(results: &[ToolResultBlock]) -> Value {
    serde_json::to_value(results).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// Encoded content consisting of a single text block.
pub fn text_content(text: impl Into<String>) -> Value {
    marshal_content_blocks(&[ContentBlock::text(text)])
}

/// Join the non-empty text blocks with single spaces.
pub fn content_blocks_to_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => {
                let text = text.trim();
                (!text.is_empty()).then_some(text)
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plain text of a persisted message, or an empty string when it has none.
pub fn message_text(role: MessageRole, raw: Option<&Value>) -> Result<String, String> {
    match role {
        MessageRole::System => parse_system_content(raw).map(|s| s.trim().to_string()),
        MessageRole::Tool => Ok(String::new()),
        _ => parse_content_blocks(role, raw).map(|blocks| content_blocks_to_text(&blocks)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_wire_format_uses_kebab_case_tags() {
        let block = ContentBlock::ToolCall {
            tool_call_id: "call-1".into(),
            tool_name: "read_file".into(),
            input: r#"{"path":"a.txt"}"#.into(),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool-call");
        assert_eq!(value["tool_name"], "read_file");

        let result = ContentBlock::ToolResult(ToolResultBlock::base("call-1", "read_file"));
        assert_eq!(serde_json::to_value(&result).unwrap()["type"], "tool-result");
    }

    #[test]
    fn is_error_is_omitted_when_false() {
        let ok = ToolResultBlock::base("c", "t").with_result(json!({"ok": true}));
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("is_error").is_none());

        let err = ToolResultBlock::base("c", "t").error("boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["is_error"], true);
        assert_eq!(value["result"]["error"], "boom");
    }

    #[test]
    fn user_content_accepts_plain_strings() {
        let blocks = parse_content_blocks(MessageRole::User, Some(&json!("hello"))).unwrap();
        assert_eq!(blocks, vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn malformed_content_is_rejected() {
        let err = parse_content_blocks(MessageRole::Assistant, Some(&json!({"nope": 1}))).unwrap_err();
        assert!(err.contains("assistant"));
        assert!(parse_system_content(Some(&json!([1, 2]))).is_err());
    }

    #[test]
    fn text_join_skips_blank_and_non_text_blocks() {
        let blocks = vec![
            ContentBlock::text("  first "),
            ContentBlock::Reasoning { text: "thinking".into() },
            ContentBlock::text("   "),
            ContentBlock::text("second"),
        ];
        assert_eq!(content_blocks_to_text(&blocks), "first second");
    }

    #[test]
    fn error_output_prefers_extracted_message() {
        let err = ToolResultBlock::base("c", "t").error("path is required");
        assert_eq!(err.output_text(), "path is required");

        let odd = ToolResultBlock {
            is_error: true,
            ..ToolResultBlock::base("c", "t").with_result(json!({"code": 7}))
        };
        assert_eq!(odd.output_text(), r#"{"code":7}"#);
    }
}

//! Turning a persisted transcript into a model prompt.
//!
//! The transcript can be broken in two ways the provider rejects: an
//! assistant tool call without a result (the run was interrupted mid-call)
//! and a tool result without a preceding call (a delegated report mirrored
//! into a parent, whose call is hidden). Both are repaired here, and every
//! tool call id is sanitized on the way out. Persisted rows are never
//! rewritten.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::chat::content::{
    ContentBlock, ToolResultBlock, parse_content_blocks, parse_system_content, parse_tool_results,
};
use crate::chat::model::{ChatMessage, MessageRole};
use crate::error::ChatError;
use crate::llm::{Message, MessagePart, Role, content_to_message_parts, tool_result_to_part};

pub const NO_WORKSPACE_INSTRUCTION: &str = "No workspace is selected yet. Call the create_workspace tool first before using read_file, write_file, or execute. If create_workspace fails, ask the user to clarify the template or workspace request.";

pub const REPORT_ONLY_INSTRUCTION: &str = "You have finished the delegated work. Call the subagent_report tool now with a concise summary of the outcome. Do not call any other tool.";

pub const INTERRUPTED_TOOL_RESULT: &str = "tool call was interrupted and did not receive a result";

static INVALID_TOOL_CALL_ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

/// Replace characters providers reject in tool call ids with `_`.
pub fn sanitize_tool_call_id(id: &str) -> String {
    INVALID_TOOL_CALL_ID_CHARS.replace_all(id, "_").into_owned()
}

/// Build the prompt for a chat from its persisted messages.
///
/// Hidden messages are dropped except system messages, which always reach
/// the model. Marker roles never do.
pub fn chat_messages_to_prompt(messages: &[ChatMessage]) -> Result<Vec<Message>, ChatError> {
    let mut prompt = Vec::with_capacity(messages.len());
    // Call ids of the assistant message a tool message may answer.
    let mut open_calls: HashSet<String> = HashSet::new();

    for message in messages {
        if message.hidden && message.role != MessageRole::System {
            continue;
        }
        let invalid = |reason: String| ChatError::InvalidMessage {
            id: message.id,
            reason,
        };

        match message.role {
            MessageRole::System => {
                let text = parse_system_content(message.content.as_ref()).map_err(invalid)?;
                if text.trim().is_empty() {
                    continue;
                }
                open_calls.clear();
                prompt.push(Message::system(text));
            }
            MessageRole::User => {
                let blocks =
                    parse_content_blocks(message.role, message.content.as_ref()).map_err(invalid)?;
                open_calls.clear();
                prompt.push(Message {
                    role: Role::User,
                    content: content_to_message_parts(&blocks),
                });
            }
            MessageRole::Assistant => {
                let blocks =
                    parse_content_blocks(message.role, message.content.as_ref()).map_err(invalid)?;
                let content = content_to_message_parts(&blocks);
                let assistant = Message {
                    role: Role::Assistant,
                    content,
                };
                open_calls = assistant
                    .tool_calls()
                    .into_iter()
                    .map(|(id, _)| id.to_string())
                    .collect();
                prompt.push(assistant);
            }
            MessageRole::Tool => {
                let results = parse_tool_results(message.content.as_ref()).map_err(invalid)?;
                let orphans: Vec<&ToolResultBlock> = results
                    .iter()
                    .filter(|r| !open_calls.contains(&r.tool_call_id))
                    .collect();
                if !orphans.is_empty() {
                    prompt.push(synthetic_tool_calls(&orphans));
                }
                prompt.push(tool_message(&results));
            }
            MessageRole::SubagentResponseMarker | MessageRole::SubagentReportOnlyMarker => {}
        }
    }

    let prompt = inject_missing_tool_results(prompt);
    Ok(sanitize_tool_call_ids(prompt))
}

fn tool_message(results: &[ToolResultBlock]) -> Message {
    Message {
        role: Role::Tool,
        content: results.iter().map(tool_result_to_part).collect(),
    }
}

/// Assistant message calling every orphaned result's tool with `{}`.
fn synthetic_tool_calls(orphans: &[&ToolResultBlock]) -> Message {
    Message {
        role: Role::Assistant,
        content: orphans
            .iter()
            .map(|r| MessagePart::ToolCall {
                tool_call_id: r.tool_call_id.clone(),
                tool_name: r.tool_name.clone(),
                input: "{}".to_string(),
            })
            .collect(),
    }
}

/// Follow every assistant tool call that has no result with a synthetic
/// error result.
///
/// Results already present in the contiguous tool messages after the
/// assistant keep their order; synthetic ones go after them, in call order.
pub fn inject_missing_tool_results(prompt: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(prompt.len());
    let mut iter = prompt.into_iter().peekable();

    while let Some(message) = iter.next() {
        if message.role != Role::Assistant {
            out.push(message);
            continue;
        }
        let calls: Vec<(String, String)> = message
            .tool_calls()
            .into_iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect();
        out.push(message);
        if calls.is_empty() {
            continue;
        }

        let mut answered: HashSet<String> = HashSet::new();
        while let Some(next) = iter.next_if(|m| m.role == Role::Tool) {
            for part in &next.content {
                if let MessagePart::ToolResult { tool_call_id, .. } = part {
                    answered.insert(tool_call_id.clone());
                }
            }
            out.push(next);
        }

        let missing: Vec<ToolResultBlock> = calls
            .into_iter()
            .filter(|(id, _)| !answered.contains(id))
            .map(|(id, name)| {
                let mut result = ToolResultBlock::base(id, name)
                    .with_result(json!({ "error": INTERRUPTED_TOOL_RESULT }));
                result.is_error = true;
                result
            })
            .collect();
        if !missing.is_empty() {
            out.push(tool_message(&missing));
        }
    }

    out
}

fn sanitize_tool_call_ids(mut prompt: Vec<Message>) -> Vec<Message> {
    for message in &mut prompt {
        for part in &mut message.content {
            match part {
                MessagePart::ToolCall { tool_call_id, .. }
                | MessagePart::ToolResult { tool_call_id, .. } => {
                    *tool_call_id = sanitize_tool_call_id(tool_call_id);
                }
                _ => {}
            }
        }
    }
    prompt
}

fn mentions_create_workspace(prompt: &[Message]) -> bool {
    prompt
        .iter()
        .filter(|m| m.role == Role::System)
        .flat_map(|m| &m.content)
        .any(|part| match part {
            MessagePart::Text { text } => text.to_lowercase().contains("create_workspace"),
            _ => false,
        })
}

/// Put `instruction` first, unless a system message already talks about
/// `create_workspace`.
pub fn prepend_system_instruction(prompt: Vec<Message>, instruction: &str) -> Vec<Message> {
    let instruction = instruction.trim();
    if instruction.is_empty() || mentions_create_workspace(&prompt) {
        return prompt;
    }
    let mut out = Vec::with_capacity(prompt.len() + 1);
    out.push(Message::system(instruction));
    out.extend(prompt);
    out
}

pub fn append_system_instruction(mut prompt: Vec<Message>, instruction: &str) -> Vec<Message> {
    let instruction = instruction.trim();
    if !instruction.is_empty() {
        prompt.push(Message::system(instruction));
    }
    prompt
}

/// Assistant content of a step without the tool results persisted as
/// separate tool messages.
pub fn step_assistant_content(
    content: &[ContentBlock],
    tool_results: &[ToolResultBlock],
) -> Vec<ContentBlock> {
    let tracked: HashSet<&str> = tool_results
        .iter()
        .map(|r| r.tool_call_id.as_str())
        .filter(|id| !id.is_empty())
        .collect();
    content
        .iter()
        .filter(|block| match block {
            ContentBlock::ToolResult(result) => !tracked.contains(result.tool_call_id.as_str()),
            _ => true,
        })
        .cloned()
        .collect()
}

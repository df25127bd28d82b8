//! Chat title helpers.

use crate::chat::content::{content_blocks_to_text, message_text};
use crate::chat::model::{Chat, ChatMessage, MessageRole};
use crate::error::LlmError;
use crate::llm::{LanguageModel, Message, ModelCall, ToolChoice};

const MAX_TITLE_CHARS: usize = 80;
const FALLBACK_TITLE_WORDS: usize = 6;

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Title derived from the first words of a message.
pub fn fallback_chat_title(message: &str) -> String {
    let words: Vec<&str> = message.split_whitespace().collect();
    if words.is_empty() {
        return "New Chat".to_string();
    }

    let mut title = words
        .iter()
        .take(FALLBACK_TITLE_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > FALLBACK_TITLE_WORDS {
        title.push('…');
    }
    truncate_chars(&title, MAX_TITLE_CHARS)
}

/// Clean up model output into a single-line title.
pub fn normalize_generated_title(title: &str) -> String {
    let title = title.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_TITLE_CHARS)
}

/// Decide whether a chat should get a generated title, and from what text.
///
/// Only a transcript with exactly one visible user message and no visible
/// assistant or tool output qualifies, and only while the title is empty or
/// still the fallback for that message.
pub fn chat_title_input(chat: &Chat, messages: &[ChatMessage]) -> Result<Option<String>, String> {
    let mut user_count = 0;
    let mut first_user_text = String::new();

    for message in messages.iter().filter(|m| !m.hidden) {
        match message.role {
            MessageRole::Assistant | MessageRole::Tool => return Ok(None),
            MessageRole::User => {
                user_count += 1;
                if first_user_text.is_empty() {
                    first_user_text = message_text(MessageRole::User, message.content.as_ref())?;
                }
            }
            _ => {}
        }
    }

    if user_count != 1 || first_user_text.is_empty() {
        return Ok(None);
    }

    let current = chat.title.trim();
    if current.is_empty() || current == fallback_chat_title(&first_user_text) {
        Ok(Some(first_user_text))
    } else {
        Ok(None)
    }
}

/// Ask the model for a title. Tools are disabled for this call.
pub async fn generate_chat_title(
    model: &dyn LanguageModel,
    system_prompt: &str,
    input: &str,
) -> Result<String, LlmError> {
    let response = model
        .generate(ModelCall {
            prompt: vec![Message::system(system_prompt), Message::user(input)],
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            max_output_tokens: Some(64),
        })
        .await
        .map_err(|e| LlmError::RequestFailed {
            provider: model.provider().to_string(),
            reason: format!("generate title text: {e}"),
        })?;

    let title = normalize_generated_title(&content_blocks_to_text(&response.content));
    if title.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: model.provider().to_string(),
            reason: "generated title was empty".to_string(),
        });
    }
    Ok(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::content::text_content;
    use crate::chat::model::ChatStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn chat(title: &str) -> Chat {
        Chat {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: title.to_string(),
            status: ChatStatus::Running,
            worker_id: None,
            started_at: None,
            parent_chat_id: None,
            root_chat_id: None,
            task_status: None,
            task_report: None,
            workspace_id: None,
            workspace_agent_id: None,
            model_config: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(id: i64, role: MessageRole, content: serde_json::Value, hidden: bool) -> ChatMessage {
        ChatMessage {
            id,
            chat_id: Uuid::nil(),
            created_at: Utc::now(),
            role,
            content: Some(content),
            tool_call_id: None,
            hidden,
            subagent_request_id: None,
            subagent_event: None,
        }
    }

    #[test]
    fn fallback_title_truncates_to_six_words() {
        assert_eq!(fallback_chat_title("   "), "New Chat");
        assert_eq!(fallback_chat_title("fix the build"), "fix the build");
        assert_eq!(
            fallback_chat_title("one two three four five six seven"),
            "one two three four five six…"
        );
        let long = "x".repeat(200);
        assert_eq!(fallback_chat_title(&long).chars().count(), 80);
    }

    #[test]
    fn normalize_strips_quotes_and_whitespace() {
        assert_eq!(normalize_generated_title("  \"Fix   the\nbuild\"  "), "Fix the build");
        assert_eq!(normalize_generated_title("`Deploy`"), "Deploy");
        assert_eq!(normalize_generated_title("   "), "");
    }

    #[test]
    fn title_input_requires_single_visible_user_message() {
        let msgs = vec![
            message(1, MessageRole::System, json!("system prompt"), true),
            message(2, MessageRole::User, text_content("Deploy the service"), false),
        ];
        assert_eq!(
            chat_title_input(&chat(""), &msgs).unwrap(),
            Some("Deploy the service".to_string())
        );

        let mut two_users = msgs.clone();
        two_users.push(message(3, MessageRole::User, json!("again"), false));
        assert_eq!(chat_title_input(&chat(""), &two_users).unwrap(), None);

        let mut answered = msgs.clone();
        answered.push(message(3, MessageRole::Assistant, text_content("ok"), false));
        assert_eq!(chat_title_input(&chat(""), &answered).unwrap(), None);
    }

    #[test]
    fn title_input_respects_user_chosen_titles() {
        let msgs = vec![message(1, MessageRole::User, json!("Deploy the service"), false)];
        assert!(chat_title_input(&chat("Deploy the service"), &msgs).unwrap().is_some());
        assert!(chat_title_input(&chat("My custom title"), &msgs).unwrap().is_none());
    }
}

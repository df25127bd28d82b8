//! The step loop: stream a model response, run the tools it called, feed the
//! results back, repeat until the model stops calling tools.
//!
//! Callers observe a run through [`AgentHooks`]: streaming callbacks for
//! every delta and an async `on_step_finish` that may persist the step and
//! abort the run by returning an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::chat::content::{ContentBlock, ToolResultBlock};
use crate::error::ChatError;
use crate::llm::{
    FinishReason, LanguageModel, Message, ModelCall, Role, StreamPart, ToolChoice,
    content_to_message_parts, tool_result_to_part,
};
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{ToolCall, ToolContext};

/// Output of one model step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Assistant content in stream order: text, reasoning, tool calls, sources.
    pub content: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    /// Results of the tools called in this step, in call order.
    pub tool_results: Vec<ToolResultBlock>,
}

impl StepResult {
    pub fn tool_calls(&self) -> impl Iterator<Item = ToolCall> + '_ {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => Some(ToolCall {
                id: tool_call_id.clone(),
                name: tool_name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub steps: Vec<StepResult>,
}

impl AgentResult {
    /// Whether the run stopped at the step ceiling while still calling tools.
    pub fn hit_step_limit(&self, max_steps: usize) -> bool {
        match self.steps.last() {
            Some(last) => {
                self.steps.len() >= max_steps
                    && last.finish_reason == FinishReason::ToolCalls
                    && last.has_tool_calls()
            }
            None => false,
        }
    }
}

/// Per-step prompt adjustments.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub messages: Vec<Message>,
    /// Restrict the tools offered (and runnable) this step.
    pub active_tools: Option<Vec<String>>,
}

/// Observer of an agent run.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    fn prepare_step(&self, _step: usize, messages: Vec<Message>) -> PreparedStep {
        PreparedStep {
            messages,
            active_tools: None,
        }
    }

    fn on_text_delta(&self, _delta: &str) {}

    fn on_reasoning_delta(&self, _delta: &str) {}

    fn on_tool_input_start(&self, _id: &str, _name: &str) {}

    fn on_tool_input_delta(&self, _id: &str, _name: &str, _delta: &str) {}

    fn on_tool_call(&self, _call: &ToolCall) {}

    fn on_source(&self, _id: &str, _url: &str, _title: &str) {}

    fn on_tool_result(&self, _result: &ToolResultBlock) {}

    async fn on_step_finish(&self, _step: &StepResult) -> Result<(), ChatError> {
        Ok(())
    }
}

/// Hooks that observe nothing.
pub struct NoHooks;

impl AgentHooks for NoHooks {}

pub struct Agent {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    max_steps: usize,
}

impl Agent {
    pub fn new(model: Arc<dyn LanguageModel>, tools: Arc<ToolRegistry>, max_steps: usize) -> Self {
        Self {
            model,
            tools,
            max_steps,
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Run the loop over `prompt` for at most `max_steps` steps.
    pub async fn run(
        &self,
        prompt: Vec<Message>,
        ctx: &ToolContext,
        hooks: &dyn AgentHooks,
    ) -> Result<AgentResult, ChatError> {
        let mut history = prompt;
        let mut result = AgentResult::default();

        for step in 0..self.max_steps {
            let prepared = hooks.prepare_step(step, history.clone());
            let active: Option<Vec<&str>> = prepared
                .active_tools
                .as_ref()
                .map(|names| names.iter().map(String::as_str).collect());
            let tools = match &active {
                Some(names) => self.tools.tool_definitions_for(names).await,
                None => self.tools.tool_definitions().await,
            };

            let (content, finish_reason) = self
                .stream_step(
                    ModelCall {
                        prompt: prepared.messages,
                        tools,
                        tool_choice: ToolChoice::Auto,
                        max_output_tokens: None,
                    },
                    hooks,
                )
                .await?;

            let mut step_result = StepResult {
                content,
                finish_reason,
                tool_results: Vec::new(),
            };
            for call in step_result.tool_calls().collect::<Vec<_>>() {
                let tool_result = self.execute_tool(&call, active.as_deref(), ctx).await;
                hooks.on_tool_result(&tool_result);
                step_result.tool_results.push(tool_result);
            }

            hooks.on_step_finish(&step_result).await?;

            history.push(Message {
                role: Role::Assistant,
                content: content_to_message_parts(&step_result.content),
            });
            if !step_result.tool_results.is_empty() {
                history.push(Message {
                    role: Role::Tool,
                    content: step_result.tool_results.iter().map(tool_result_to_part).collect(),
                });
            }

            let done = step_result.tool_results.is_empty();
            result.steps.push(step_result);
            if done {
                break;
            }
        }

        Ok(result)
    }

    async fn stream_step(
        &self,
        call: ModelCall,
        hooks: &dyn AgentHooks,
    ) -> Result<(Vec<ContentBlock>, FinishReason), ChatError> {
        let mut stream = self.model.stream(call).await?;
        let mut content: Vec<ContentBlock> = Vec::new();
        let mut finish_reason = FinishReason::Stop;
        let mut tool_names: HashMap<String, String> = HashMap::new();

        while let Some(part) = stream.next().await {
            match part? {
                StreamPart::TextDelta(delta) => {
                    hooks.on_text_delta(&delta);
                    match content.last_mut() {
                        Some(ContentBlock::Text { text }) => text.push_str(&delta),
                        _ => content.push(ContentBlock::Text { text: delta }),
                    }
                }
                StreamPart::ReasoningDelta(delta) => {
                    hooks.on_reasoning_delta(&delta);
                    match content.last_mut() {
                        Some(ContentBlock::Reasoning { text }) => text.push_str(&delta),
                        _ => content.push(ContentBlock::Reasoning { text: delta }),
                    }
                }
                StreamPart::ToolInputStart { id, name } => {
                    hooks.on_tool_input_start(&id, &name);
                    tool_names.insert(id, name);
                }
                StreamPart::ToolInputDelta { id, delta } => {
                    let name = tool_names.get(&id).map(String::as_str).unwrap_or_default();
                    hooks.on_tool_input_delta(&id, name, &delta);
                }
                StreamPart::ToolCall { id, name, input } => {
                    let call = ToolCall { id, name, input };
                    hooks.on_tool_call(&call);
                    content.push(ContentBlock::ToolCall {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        input: call.input,
                    });
                }
                StreamPart::Source { id, url, title } => {
                    hooks.on_source(&id, &url, &title);
                    content.push(ContentBlock::Source { id, url, title });
                }
                StreamPart::Finish(reason) => finish_reason = reason,
            }
        }

        Ok((content, finish_reason))
    }

    async fn execute_tool(
        &self,
        call: &ToolCall,
        active: Option<&[&str]>,
        ctx: &ToolContext,
    ) -> ToolResultBlock {
        let allowed = active.is_none_or(|names| names.contains(&call.name.as_str()));
        let tool = match self.tools.get(&call.name).await {
            Some(tool) if allowed => tool,
            _ => {
                debug!(tool = %call.name, "Model called an unavailable tool");
                return call
                    .result()
                    .error(format!("tool {:?} is not available", call.name));
            }
        };
        tool.execute(call, ctx).await
    }
}

//! Agent runtime: the model/tool step loop and its hooks.

pub mod agent_loop;

pub use agent_loop::{Agent, AgentHooks, AgentResult, NoHooks, PreparedStep, StepResult};

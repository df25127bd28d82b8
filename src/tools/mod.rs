//! Tools a chat run exposes to the model.

pub mod create_workspace;
pub mod registry;
pub mod subagent;
pub mod tool;
pub mod workspace;

use std::sync::Arc;

pub use registry::ToolRegistry;
pub use tool::*;

/// Registry with every chat tool registered.
pub fn chat_tools() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register_sync(Arc::new(create_workspace::CreateWorkspaceTool));
    registry.register_sync(Arc::new(workspace::ReadFileTool));
    registry.register_sync(Arc::new(workspace::WriteFileTool));
    registry.register_sync(Arc::new(workspace::EditFilesTool));
    registry.register_sync(Arc::new(workspace::ExecuteTool));
    registry.register_sync(Arc::new(subagent::SubagentTool));
    registry.register_sync(Arc::new(subagent::SubagentAwaitTool));
    registry.register_sync(Arc::new(subagent::SubagentMessageTool));
    registry.register_sync(Arc::new(subagent::SubagentReportTool));
    registry.register_sync(Arc::new(subagent::SubagentTerminateTool));
    registry
}

//! The engine's seam to the tool layer. Production code hands the
//! engine an [`McpManager`]; tests substitute a scripted invoker.

use std::time::Duration;

use knack_mcp::{CallError, McpManager, ToolSnapshot};
use serde_json::Value;

use crate::BoxFuture;

/// Resolves tool names and performs calls on behalf of running steps.
pub trait ToolInvoker: Send + Sync {
    /// Resolve a bare or qualified tool name to a snapshot, or `None`
    /// if no visible server advertises it.
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<ToolSnapshot>>;

    /// Invoke a resolved tool with bound arguments.
    fn call<'a>(
        &'a self,
        tool: &'a ToolSnapshot,
        arguments: Value,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<Value, CallError>>;
}

impl ToolInvoker for McpManager {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<ToolSnapshot>> {
        Box::pin(McpManager::resolve(self, name))
    }

    fn call<'a>(
        &'a self,
        tool: &'a ToolSnapshot,
        arguments: Value,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<Value, CallError>> {
        Box::pin(self.call_snapshot(tool, arguments, deadline))
    }
}

//! Tools shared by the unit tests of this crate.

use async_trait::async_trait;
use conclave_core::error::ToolError;
use conclave_core::tool::{Tool, ToolRegistry, ToolResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleeps for `ms` milliseconds, then answers with `tag`.
pub struct DelayTool;

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Wait, then echo a tag"
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        let tag = arguments["tag"].as_str().unwrap_or_default().to_string();
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled { tool_name: "delay".into() }),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ToolResult::ok(tag)),
        }
    }
}

/// Always reports a structured failure.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::err("intentional failure"))
    }
}

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}

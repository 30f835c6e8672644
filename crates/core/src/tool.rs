//! Tool trait — the abstraction over side-effecting capabilities.
//!
//! Models ask for capabilities by name. A `CapabilityProvider` resolves the
//! name and runs the call; the `ToolRegistry` is the standard provider,
//! mapping names to registered `Tool` handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID within a loop run
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// Structured result of a capability call: `{success, output?, error?}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Failure description for expected error modes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Normalize a stdio plugin response.
    ///
    /// Success: `{"status":"success","result":..,"messageForAI":..}`.
    /// Failure: `{"status":"error","plugin_error":..}`.
    pub fn from_plugin_json(value: &serde_json::Value) -> Self {
        let status = value.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status.eq_ignore_ascii_case("success") {
            let mut output = match value.get("result") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            if let Some(note) = value.get("messageForAI").and_then(|m| m.as_str()) {
                if !note.is_empty() && note != output {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(note);
                }
            }
            return Self {
                success: true,
                output: Some(output),
                error: None,
                data: Some(value.clone()),
            };
        }

        let error = value
            .get("plugin_error")
            .or_else(|| value.get("error"))
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("plugin returned status '{status}'"));
        Self {
            success: false,
            output: None,
            error: Some(error),
            data: Some(value.clone()),
        }
    }
}

/// A tool description advertised to models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// The core Tool trait.
///
/// Tools must report expected failures as `ToolResult { success: false, .. }`
/// and keep `Err` for calls that could not run at all.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (shown to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Resolves capability names to behavior.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Run `tool_name`. Unknown names yield `ToolError::NotFound`.
    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Capabilities to advertise to models.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// A registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl CapabilityProvider for ToolRegistry {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<ToolResult, ToolError> {
        let tool = self.get(tool_name).ok_or_else(|| ToolError::NotFound {
            name: tool_name.to_string(),
            available: self.names().join(", "),
        })?;
        tool.execute(arguments, cancel).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

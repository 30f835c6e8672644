//! Stdio plugins — external programs exposed as tools.
//!
//! The plugin receives the call's JSON arguments on stdin and answers on
//! stdout with `{"status": "success", "result": ..., "messageForAI": ...}`
//! or `{"status": "error", "plugin_error": ...}`.

use async_trait::async_trait;
use conclave_config::PluginConfig;
use conclave_core::error::ToolError;
use conclave_core::tool::{Tool, ToolRegistry, ToolResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs a configured command once per call.
pub struct StdioPluginTool {
    name: String,
    description: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl StdioPluginTool {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        let mut tool = Self::new(&config.name, &config.command)
            .with_description(&config.description)
            .with_args(config.args.iter().cloned());
        if let Some(dir) = &config.working_dir {
            tool = tool.with_working_dir(dir);
        }
        tool
    }

    fn failed(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Tool for StdioPluginTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let input = serde_json::to_vec(&arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(plugin = %self.name, command = %self.command, "Starting plugin");
        let mut child = command
            .spawn()
            .map_err(|e| self.failed(format!("could not start '{}': {e}", self.command)))?;

        // Feed stdin while stdout drains, or a chatty plugin fills its pipe
        if let Some(mut stdin) = child.stdin.take() {
            let plugin = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!(plugin = %plugin, error = %e, "Plugin did not accept its input");
                }
                // Dropping stdin closes the pipe so the plugin sees EOF
            });
        }

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ToolError::Cancelled { tool_name: self.name.clone() });
            }
            output = child.wait_with_output() => {
                output.map_err(|e| self.failed(e.to_string()))?
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        let stderr = String::from_utf8_lossy(&output.stderr);

        let response = serde_json::from_str::<serde_json::Value>(stdout).ok().or_else(|| {
            // Some plugins log before answering; the response is the last line
            stdout
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .and_then(|line| serde_json::from_str(line.trim()).ok())
        });

        match response {
            Some(value) if value.get("status").is_some() => Ok(ToolResult::from_plugin_json(&value)),
            _ if output.status.success() && !stdout.is_empty() => Ok(ToolResult::ok(stdout)),
            _ => {
                let code = output.status.code().unwrap_or(-1);
                warn!(plugin = %self.name, exit_code = code, "Plugin produced no response");
                Err(self.failed(format!(
                    "exit code {code}, no protocol response{}",
                    if stderr.trim().is_empty() {
                        String::new()
                    } else {
                        format!(": {}", stderr.trim())
                    }
                )))
            }
        }
    }
}

/// Build a registry holding every enabled plugin.
pub fn registry_from_plugins(plugins: &[PluginConfig]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for plugin in plugins.iter().filter(|p| p.enabled) {
        registry.register(Arc::new(StdioPluginTool::from_config(plugin)));
    }
    registry
}

//! The only entry point the rest of the application uses for tool calls.

use serde::Serialize;
use serde_json::Value;

use crate::bridge::supervisor::{ProcessState, Supervisor};
use crate::error::{Error, Result};
use crate::mcp::protocol::ToolResult;

/// Decoded payload of a successful tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    /// The tool's text parsed as JSON.
    Json(Value),
    /// The tool's text verbatim, when it was not JSON.
    Text(String),
}

impl ToolOutput {
    /// Collapse into a JSON value; raw text becomes a JSON string.
    pub fn into_value(self) -> Value {
        match self {
            ToolOutput::Json(value) => value,
            ToolOutput::Text(text) => Value::String(text),
        }
    }
}

/// Unwrap an MCP `tools/call` result envelope.
///
/// Text blocks are joined with newlines (a single block is taken as is),
/// then parsed as JSON with a fallback to the raw text. A result carrying
/// no text blocks is returned untouched. `isError` results become
/// [`Error::ToolFailed`].
pub fn unwrap_tool_result(tool: &str, result: Value) -> Result<ToolOutput> {
    let envelope: ToolResult = match serde_json::from_value(result.clone()) {
        Ok(envelope) => envelope,
        Err(_) => return Ok(ToolOutput::Json(result)),
    };

    let texts: Vec<&str> = envelope.texts().collect();
    if texts.is_empty() {
        if envelope.is_error {
            return Err(Error::ToolFailed {
                tool: tool.to_string(),
                message: "tool reported an error".to_string(),
            });
        }
        return Ok(ToolOutput::Json(result));
    }
    let text = texts.join("\n");

    if envelope.is_error {
        return Err(Error::ToolFailed {
            tool: tool.to_string(),
            message: text,
        });
    }

    Ok(match serde_json::from_str::<Value>(&text) {
        Ok(value) => ToolOutput::Json(value),
        Err(_) => ToolOutput::Text(text),
    })
}

/// Tool-call façade over the scheduled-task server.
///
/// Calls never auto-start the server: callers run [`CronBridge::restart`]
/// whenever settings are saved, and a stopped server answers every call
/// with [`Error::NotRunning`].
pub struct CronBridge {
    supervisor: Supervisor,
}

impl CronBridge {
    /// Wrap a supervisor.
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Call `name` and unwrap its result.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutput> {
        let result = self.supervisor.call(name, args).await?;
        unwrap_tool_result(name, result)
    }

    /// Start at boot if configured.
    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await
    }

    /// Apply the current settings, respawning only on change.
    pub async fn restart(&self) -> Result<()> {
        self.supervisor.restart().await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await
    }
}

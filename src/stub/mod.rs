//! In-memory scheduled-task MCP server.
//!
//! Ships as the `cron-stub` binary. It answers the same task tools the
//! real scheduler exposes, keeps everything in memory, and adds a few
//! diagnostic tools (`server_info`, `sleep`, `exit`, ...) that make
//! process lifecycle observable from the outside.

pub mod tools;
pub mod transport;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::*;

/// Handler for one MCP tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> Tool;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Map<String, Value>) -> Result<ToolResult>;
}

/// Registry of tool handlers.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool handler.
    pub fn register<T: ToolHandler + 'static>(&mut self, handler: T) {
        let tool = handler.definition();
        self.tools.insert(tool.name.clone(), Arc::new(handler));
    }

    /// All registered tools, sorted by name.
    pub fn list_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|h| h.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

/// How the stub reacts to traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StubMode {
    /// Behave like a normal MCP server.
    #[default]
    Normal,
    /// Read everything, answer nothing (handshake never completes).
    Silent,
}

/// Process-wide facts reported by `server_info`.
#[derive(Debug)]
pub struct StubState {
    pub label: String,
    pub pid: u32,
    pub started_at: String,
    pub calls: AtomicU64,
}

impl StubState {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            calls: AtomicU64::new(0),
        }
    }
}

/// The stub MCP server.
#[derive(Clone)]
pub struct StubServer {
    registry: Arc<ToolRegistry>,
    state: Arc<StubState>,
    mode: StubMode,
}

impl StubServer {
    /// Server with the full task and diagnostic tool set.
    pub fn new(label: impl Into<String>, mode: StubMode) -> Self {
        let state = Arc::new(StubState::new(label));
        let mut registry = ToolRegistry::new();
        tools::register_all_tools(&mut registry, Arc::new(tools::TaskStore::new()), state.clone());
        Self {
            registry: Arc::new(registry),
            state,
            mode,
        }
    }

    /// Serve stdin/stdout until stdin closes.
    pub async fn run(self) -> Result<()> {
        info!(
            label = %self.state.label,
            tools = self.registry.tool_count(),
            mode = ?self.mode,
            "Starting cron stub"
        );

        let (mut incoming, outgoing, writer) = transport::start();

        while let Some(msg) = incoming.recv().await {
            match msg {
                Message::Request(req) => {
                    if self.mode == StubMode::Silent {
                        debug!("Silent mode, ignoring {}", req.method);
                        continue;
                    }
                    let server = self.clone();
                    let outgoing = outgoing.clone();
                    tokio::spawn(async move {
                        let response = server.handle_request(req).await;
                        if outgoing.send(response).await.is_err() {
                            warn!("Failed to send response");
                        }
                    });
                }
                Message::Notification(notif) => {
                    debug!("Handling notification: {}", notif.method);
                    if notif.method == "notifications/initialized" {
                        info!("Client initialized");
                    }
                }
                Message::Success { .. } | Message::Failure { .. } => {
                    warn!("Received unexpected response");
                }
            }
        }

        // Let in-flight handlers finish writing before exiting.
        drop(outgoing);
        let _ = writer.await;

        info!("Cron stub stopped");
        Ok(())
    }

    /// Handle a JSON-RPC request.
    pub async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Handling request: {} (id: {})", req.method, req.id);

        let result = match req.method.as_str() {
            "initialize" => self.handle_initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(req.params).await,
            _ => Err(Error::Rpc {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("Unknown method: {}", req.method),
            }),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(req.id, value),
            Err(Error::Rpc { code, message }) => JsonRpcResponse::failure(req.id, code, message),
            Err(e @ Error::Json(_)) => {
                JsonRpcResponse::failure(req.id, error_codes::INVALID_PARAMS, e.to_string())
            }
            Err(e) => JsonRpcResponse::failure(req.id, error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    fn handle_initialize(&self) -> Result<Value> {
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                ..ServerCapabilities::default()
            },
            server_info: Some(Implementation {
                name: "cron-stub".to_string(),
                version: crate::VERSION.to_string(),
            }),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_list_tools(&self) -> Result<Value> {
        let result = ListToolsResult {
            tools: self.registry.list_tools(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params: CallToolParams = serde_json::from_value(params.unwrap_or(Value::Null))?;
        self.state.calls.fetch_add(1, Ordering::SeqCst);

        let handler = self.registry.get_tool(&params.name).ok_or_else(|| Error::Rpc {
            code: error_codes::INVALID_PARAMS,
            message: format!("Tool not found: {}", params.name),
        })?;

        let result = handler.execute(params.arguments).await?;
        Ok(serde_json::to_value(result)?)
    }
}

// ===== Argument Helpers =====

fn invalid_params(message: String) -> Error {
    Error::Rpc {
        code: error_codes::INVALID_PARAMS,
        message,
    }
}

/// Extract a required string argument. Numbers are accepted as ids.
pub fn get_string_arg(args: &Map<String, Value>, name: &str) -> Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(invalid_params(format!("Missing required argument: {}", name))),
    }
}

/// Extract an optional string argument.
pub fn get_optional_string_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// Extract an optional integer argument.
pub fn get_u64_arg(args: &Map<String, Value>, name: &str, default: u64) -> u64 {
    args.get(name).and_then(|v| v.as_u64()).unwrap_or(default)
}

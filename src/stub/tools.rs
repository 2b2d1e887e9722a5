//! Tools served by the cron stub.
//!
//! Task tools share one handler type parameterized by [`TaskOp`]. The
//! diagnostic tools each get their own handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{error_codes, Tool, ToolResult};
use crate::stub::{
    get_optional_string_arg, get_string_arg, get_u64_arg, StubState, ToolHandler, ToolRegistry,
};

/// Longest delay `sleep` accepts.
const MAX_SLEEP_MS: u64 = 60_000;

/// What a task does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Command,
    Ai,
}

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    pub run_count: u64,
}

/// Outcome of the most recent run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub ran_at: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Default)]
struct TaskStoreInner {
    tasks: BTreeMap<String, Task>,
    results: BTreeMap<String, TaskRun>,
}

/// In-memory task storage.
#[derive(Debug, Default)]
pub struct TaskStore {
    inner: RwLock<TaskStoreInner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    /// Insert a new task with a fresh id.
    pub async fn add(
        &self,
        name: String,
        schedule: String,
        kind: TaskKind,
        body: String,
    ) -> Task {
        let now = chrono::Utc::now().to_rfc3339();
        let (command, prompt) = match kind {
            TaskKind::Command => (Some(body), None),
            TaskKind::Ai => (None, Some(body)),
        };
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            schedule,
            kind,
            command,
            prompt,
            enabled: true,
            created_at: now.clone(),
            updated_at: now,
            run_count: 0,
        };
        self.inner
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        task
    }

    /// Apply `change` to a task and bump its update time.
    pub async fn modify<F>(&self, id: &str, change: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(id)?;
        change(task);
        task.updated_at = chrono::Utc::now().to_rfc3339();
        Some(task.clone())
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.results.remove(id);
        inner.tasks.remove(id).is_some()
    }

    /// Run a task once, recording the outcome as its latest result.
    pub async fn run(&self, id: &str) -> Option<TaskRun> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(id)?;
        task.run_count += 1;
        let output = match task.kind {
            TaskKind::Command => format!(
                "Ran command: {}",
                task.command.as_deref().unwrap_or_default()
            ),
            TaskKind::Ai => format!("Ran prompt: {}", task.prompt.as_deref().unwrap_or_default()),
        };
        let run = TaskRun {
            task_id: task.id.clone(),
            ran_at: chrono::Utc::now().to_rfc3339(),
            success: true,
            output,
        };
        inner.results.insert(id.to_string(), run.clone());
        Some(run)
    }

    pub async fn result(&self, id: &str) -> Option<Option<TaskRun>> {
        let inner = self.inner.read().await;
        if !inner.tasks.contains_key(id) {
            return None;
        }
        Some(inner.results.get(id).cloned())
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<ToolResult> {
    Ok(ToolResult::text(serde_json::to_string(value)?))
}

fn not_found(id: &str) -> ToolResult {
    ToolResult::error(format!("Task {} not found", id))
}

fn id_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": { "type": "string", "description": description }
        },
        "required": ["id"]
    })
}

// ===== Task Tools =====

/// Operations exposed as task tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    List,
    Get,
    Add,
    AddAi,
    Update,
    Remove,
    Run,
    Enable,
    Disable,
    Result,
}

impl TaskOp {
    pub const ALL: [TaskOp; 10] = [
        TaskOp::List,
        TaskOp::Get,
        TaskOp::Add,
        TaskOp::AddAi,
        TaskOp::Update,
        TaskOp::Remove,
        TaskOp::Run,
        TaskOp::Enable,
        TaskOp::Disable,
        TaskOp::Result,
    ];

    pub fn tool_name(self) -> &'static str {
        match self {
            TaskOp::List => "list_tasks",
            TaskOp::Get => "get_task",
            TaskOp::Add => "add_task",
            TaskOp::AddAi => "add_ai_task",
            TaskOp::Update => "update_task",
            TaskOp::Remove => "remove_task",
            TaskOp::Run => "run_task",
            TaskOp::Enable => "enable_task",
            TaskOp::Disable => "disable_task",
            TaskOp::Result => "get_task_result",
        }
    }
}

/// One task tool backed by the shared store.
pub struct TaskTool {
    op: TaskOp,
    store: Arc<TaskStore>,
}

impl TaskTool {
    pub fn new(op: TaskOp, store: Arc<TaskStore>) -> Self {
        Self { op, store }
    }
}

#[async_trait]
impl ToolHandler for TaskTool {
    fn definition(&self) -> Tool {
        let (description, input_schema) = match self.op {
            TaskOp::List => (
                "List all scheduled tasks.",
                json!({ "type": "object", "properties": {} }),
            ),
            TaskOp::Get => ("Get one scheduled task.", id_schema("Task id")),
            TaskOp::Add => (
                "Schedule a shell command.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "schedule": { "type": "string", "description": "Cron expression" },
                        "command": { "type": "string" }
                    },
                    "required": ["name", "schedule", "command"]
                }),
            ),
            TaskOp::AddAi => (
                "Schedule a prompt for the assistant.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "schedule": { "type": "string", "description": "Cron expression" },
                        "prompt": { "type": "string" }
                    },
                    "required": ["schedule", "prompt"]
                }),
            ),
            TaskOp::Update => (
                "Change fields of a scheduled task.",
                json!({
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "name": { "type": "string" },
                        "schedule": { "type": "string" },
                        "command": { "type": "string" },
                        "prompt": { "type": "string" },
                        "enabled": { "type": "boolean" }
                    },
                    "required": ["id"]
                }),
            ),
            TaskOp::Remove => ("Delete a scheduled task.", id_schema("Task id")),
            TaskOp::Run => ("Run a task immediately.", id_schema("Task id")),
            TaskOp::Enable => ("Enable a task.", id_schema("Task id")),
            TaskOp::Disable => ("Disable a task.", id_schema("Task id")),
            TaskOp::Result => ("Latest run result of a task.", id_schema("Task id")),
        };
        Tool {
            name: self.op.tool_name().to_string(),
            description: description.to_string(),
            input_schema,
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        match self.op {
            TaskOp::List => json_result(&self.store.list().await),
            TaskOp::Get => {
                let id = get_string_arg(&args, "id")?;
                match self.store.get(&id).await {
                    Some(task) => json_result(&task),
                    None => Ok(not_found(&id)),
                }
            }
            TaskOp::Add => {
                let name = get_string_arg(&args, "name")?;
                let schedule = get_string_arg(&args, "schedule")?;
                let command = get_string_arg(&args, "command")?;
                let task = self
                    .store
                    .add(name, schedule, TaskKind::Command, command)
                    .await;
                info!("Added task {} ({})", task.id, task.name);
                json_result(&task)
            }
            TaskOp::AddAi => {
                let schedule = get_string_arg(&args, "schedule")?;
                let prompt = get_string_arg(&args, "prompt")?;
                let name = get_optional_string_arg(&args, "name")
                    .unwrap_or_else(|| prompt.chars().take(40).collect());
                let task = self.store.add(name, schedule, TaskKind::Ai, prompt).await;
                info!("Added AI task {} ({})", task.id, task.name);
                json_result(&task)
            }
            TaskOp::Update => {
                let id = get_string_arg(&args, "id")?;
                let enabled = args.get("enabled").and_then(Value::as_bool);
                let updated = self
                    .store
                    .modify(&id, |task| {
                        if let Some(name) = get_optional_string_arg(&args, "name") {
                            task.name = name;
                        }
                        if let Some(schedule) = get_optional_string_arg(&args, "schedule") {
                            task.schedule = schedule;
                        }
                        if let Some(command) = get_optional_string_arg(&args, "command") {
                            task.command = Some(command);
                        }
                        if let Some(prompt) = get_optional_string_arg(&args, "prompt") {
                            task.prompt = Some(prompt);
                        }
                        if let Some(enabled) = enabled {
                            task.enabled = enabled;
                        }
                    })
                    .await;
                match updated {
                    Some(task) => json_result(&task),
                    None => Ok(not_found(&id)),
                }
            }
            TaskOp::Remove => {
                let id = get_string_arg(&args, "id")?;
                if self.store.remove(&id).await {
                    json_result(&json!({ "removed": id }))
                } else {
                    Ok(not_found(&id))
                }
            }
            TaskOp::Run => {
                let id = get_string_arg(&args, "id")?;
                match self.store.run(&id).await {
                    Some(run) => json_result(&run),
                    None => Ok(not_found(&id)),
                }
            }
            TaskOp::Enable | TaskOp::Disable => {
                let id = get_string_arg(&args, "id")?;
                let enabled = self.op == TaskOp::Enable;
                match self.store.modify(&id, |task| task.enabled = enabled).await {
                    Some(task) => json_result(&task),
                    None => Ok(not_found(&id)),
                }
            }
            TaskOp::Result => {
                let id = get_string_arg(&args, "id")?;
                match self.store.result(&id).await {
                    Some(run) => json_result(&run),
                    None => Ok(not_found(&id)),
                }
            }
        }
    }
}

// ===== Diagnostic Tools =====

/// Reports the process identity and how many calls it has served.
pub struct ServerInfoTool {
    state: Arc<StubState>,
}

#[async_trait]
impl ToolHandler for ServerInfoTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "server_info".to_string(),
            description: "Report pid, label and call count of this server process.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _args: Map<String, Value>) -> Result<ToolResult> {
        json_result(&json!({
            "pid": self.state.pid,
            "label": self.state.label,
            "calls": self.state.calls.load(Ordering::SeqCst),
            "started_at": self.state.started_at,
        }))
    }
}

/// Replies with plain text that is not JSON.
pub struct EchoTextTool;

#[async_trait]
impl ToolHandler for EchoTextTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "echo_text".to_string(),
            description: "Echo `text` back verbatim.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        Ok(ToolResult::text(get_string_arg(&args, "text")?))
    }
}

/// Fails at the protocol level with a JSON-RPC error.
pub struct FailTool;

#[async_trait]
impl ToolHandler for FailTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "fail".to_string(),
            description: "Answer with a JSON-RPC error.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        Err(Error::Rpc {
            code: error_codes::INTERNAL_ERROR,
            message: get_optional_string_arg(&args, "message")
                .unwrap_or_else(|| "requested failure".to_string()),
        })
    }
}

/// Fails at the tool level with an `isError` result.
pub struct ToolErrorTool;

#[async_trait]
impl ToolHandler for ToolErrorTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "tool_error".to_string(),
            description: "Answer with an isError tool result.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        Ok(ToolResult::error(
            get_optional_string_arg(&args, "message")
                .unwrap_or_else(|| "tool failed".to_string()),
        ))
    }
}

/// Waits before answering.
pub struct SleepTool;

#[async_trait]
impl ToolHandler for SleepTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "sleep".to_string(),
            description: "Wait `ms` milliseconds, then echo `tag`.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ms": { "type": "integer" },
                    "tag": { "type": "string" }
                }
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        let ms = get_u64_arg(&args, "ms", 100).min(MAX_SLEEP_MS);
        let tag = args.get("tag").cloned().unwrap_or(Value::Null);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        json_result(&json!({ "slept_ms": ms, "tag": tag }))
    }
}

/// Terminates the process without replying.
pub struct ExitTool;

#[async_trait]
impl ToolHandler for ExitTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "exit".to_string(),
            description: "Exit the server process immediately.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "code": { "type": "integer" } }
            }),
        }
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<ToolResult> {
        let code = get_u64_arg(&args, "code", 0) as i32;
        warn!("Exiting on request with code {}", code);
        std::process::exit(code);
    }
}

/// Register the task tools and the diagnostic tools.
pub fn register_all_tools(
    registry: &mut ToolRegistry,
    store: Arc<TaskStore>,
    state: Arc<StubState>,
) {
    for op in TaskOp::ALL {
        registry.register(TaskTool::new(op, store.clone()));
    }
    registry.register(ServerInfoTool { state });
    registry.register(EchoTextTool);
    registry.register(FailTool);
    registry.register(ToolErrorTool);
    registry.register(SleepTool);
    registry.register(ExitTool);
}

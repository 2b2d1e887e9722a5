//! Configuration management for the assistant bridge.
//!
//! Two layers live here: process-level [`Config`] built from CLI args and
//! environment, and the [`SettingsStore`] registry of named tool servers
//! that the UI edits at runtime.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Registry key of the scheduled-task tool server.
pub const DEFAULT_SERVER_KEY: &str = "cron";

/// Command-line arguments for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(name = "assistant-bridge")]
#[command(author = "Assistant Bridge Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Personal assistant backend supervising MCP tool servers over stdio")]
pub struct Args {
    /// Address to bind the HTTP API on
    #[arg(long, default_value = "127.0.0.1", env = "ASSISTANT_BRIDGE_HOST")]
    pub host: String,

    /// HTTP port
    #[arg(short, long, default_value = "3000", env = "ASSISTANT_BRIDGE_PORT")]
    pub port: u16,

    /// Tool-server registry file (JSON, or YAML by extension)
    #[arg(short, long, env = "ASSISTANT_BRIDGE_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Registry key of the supervised scheduled-task server
    #[arg(long, default_value = DEFAULT_SERVER_KEY, env = "ASSISTANT_BRIDGE_SERVER_KEY")]
    pub server_key: String,

    /// Deadline for the MCP initialize handshake (milliseconds)
    #[arg(long, default_value = "10000", env = "ASSISTANT_BRIDGE_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: u64,

    /// Deadline for a single tool call (milliseconds)
    #[arg(long, default_value = "30000", env = "ASSISTANT_BRIDGE_CALL_TIMEOUT_MS")]
    pub call_timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long, env = "ASSISTANT_BRIDGE_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "ASSISTANT_BRIDGE_LOG_JSON")]
    pub log_json: bool,
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Registry file
    pub settings_path: PathBuf,
    /// Supervised server key
    pub server_key: String,
    /// Handshake deadline in milliseconds
    pub handshake_timeout_ms: u64,
    /// Tool call deadline in milliseconds
    pub call_timeout_ms: u64,
    /// Debug mode
    pub debug: bool,
    /// JSON log output
    pub log_json: bool,
}

impl Config {
    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// `host:port` pair for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Default location of the registry file.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("assistant-bridge")
        .join("mcp_servers.json")
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            settings_path: args.settings.unwrap_or_else(default_settings_path),
            server_key: args.server_key,
            handshake_timeout_ms: args.handshake_timeout_ms,
            call_timeout_ms: args.call_timeout_ms,
            debug: args.debug,
            log_json: args.log_json,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            settings_path: default_settings_path(),
            server_key: DEFAULT_SERVER_KEY.to_string(),
            handshake_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
            debug: false,
            log_json: false,
        }
    }
}

// ===== Tool Server Registry =====

/// How to launch one tool server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Executable to run
    pub command: String,
    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (merged over the bridge's own environment)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ToolServerConfig {
    /// Config running `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Reject entries that could never be spawned.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("tool server command must not be empty".to_string()));
        }
        Ok(())
    }
}

/// On-disk registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    pub mcp_servers: BTreeMap<String, ToolServerConfig>,
}

/// Registry file encoding, picked by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

/// Named tool-server configs, optionally persisted to a file.
pub struct SettingsStore {
    path: Option<PathBuf>,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    /// Store that lives only in memory.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            settings: RwLock::new(settings),
        }
    }

    /// Load the registry from `path`. A missing file is an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = match fs::read_to_string(&path).await {
            Ok(raw) => parse(&raw, Format::of(&path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, starting empty", path.display());
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Loaded {} tool server(s) from {}",
            settings.mcp_servers.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            settings: RwLock::new(settings),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up one server by key.
    pub async fn get(&self, key: &str) -> Option<ToolServerConfig> {
        self.settings.read().await.mcp_servers.get(key).cloned()
    }

    /// All configured servers.
    pub async fn list(&self) -> BTreeMap<String, ToolServerConfig> {
        self.settings.read().await.mcp_servers.clone()
    }

    /// Insert or replace a server entry and persist.
    pub async fn upsert(&self, key: &str, config: ToolServerConfig) -> Result<()> {
        config.validate()?;
        let mut settings = self.settings.write().await;
        let mut next = settings.clone();
        next.mcp_servers.insert(key.to_string(), config);
        self.persist(&next).await?;
        *settings = next;
        Ok(())
    }

    /// Remove a server entry and persist. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut settings = self.settings.write().await;
        if !settings.mcp_servers.contains_key(key) {
            return Ok(false);
        }
        let mut next = settings.clone();
        next.mcp_servers.remove(key);
        self.persist(&next).await?;
        *settings = next;
        Ok(true)
    }

    async fn persist(&self, settings: &Settings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let body = match Format::of(path) {
            Format::Json => serde_json::to_string_pretty(settings)?,
            Format::Yaml => serde_yaml::to_string(settings)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, path).await?;
        debug!("Persisted settings to {}", path.display());
        Ok(())
    }
}

fn parse(raw: &str, format: Format) -> Result<Settings> {
    if raw.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings = match format {
        Format::Json => serde_json::from_str(raw)?,
        Format::Yaml => serde_yaml::from_str(raw)?,
    };
    Ok(settings)
}

//! Lifecycle of the supervised tool server.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`,
//! with `Starting -> Stopped` on spawn or handshake failure and
//! `Running -> Stopped` when the child dies on its own. A crashed server is
//! never restarted here; the next [`Supervisor::restart`] brings it back.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::fingerprint::ConfigFingerprint;
use crate::config::{Config, SettingsStore, ToolServerConfig};
use crate::error::{Error, Result};
use crate::mcp::connection::Connection;
use crate::mcp::handshake;
use crate::mcp::protocol::Implementation;
use crate::metrics::Metrics;

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Deadlines and identity used by the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub client_info: Implementation,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            client_info: handshake::client_info(),
        }
    }
}

impl From<&Config> for SupervisorOptions {
    fn from(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            call_timeout: config.call_timeout(),
            ..Self::default()
        }
    }
}

/// Fast-path view shared with the exit watcher.
struct Slot {
    state: ProcessState,
    connection: Option<Arc<Connection>>,
}

/// Held across a whole start, stop or restart.
struct Lifecycle {
    fingerprint: Option<ConfigFingerprint>,
}

/// Owns the single tool-server process for one registry key.
pub struct Supervisor {
    server: String,
    store: Arc<SettingsStore>,
    options: SupervisorOptions,
    metrics: Arc<Metrics>,
    slot: Arc<StdMutex<Slot>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Supervisor {
    /// Create a stopped supervisor for registry entry `server`.
    pub fn new(
        server: impl Into<String>,
        store: Arc<SettingsStore>,
        options: SupervisorOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            server: server.into(),
            store,
            options,
            metrics,
            slot: Arc::new(StdMutex::new(Slot {
                state: ProcessState::Stopped,
                connection: None,
            })),
            lifecycle: Mutex::new(Lifecycle { fingerprint: None }),
        }
    }

    /// Registry key this supervisor manages.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.slot().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Pid of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        let slot = self.slot();
        match slot.state {
            ProcessState::Running => slot.connection.as_ref().and_then(|c| c.pid()),
            _ => None,
        }
    }

    /// Fingerprint recorded at the last successful start.
    pub async fn fingerprint(&self) -> Option<ConfigFingerprint> {
        self.lifecycle.lock().await.fingerprint.clone()
    }

    /// Start the server if it is configured and not already up.
    pub async fn start(&self) -> Result<()> {
        if matches!(self.state(), ProcessState::Running | ProcessState::Starting) {
            return Ok(());
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        let Some(config) = self.store.get(&self.server).await else {
            debug!(server = %self.server, "No tool server configured, not starting");
            return Ok(());
        };
        self.launch(&mut lifecycle, config).await
    }

    /// Kill the server and reject everything still waiting on it.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.halt(&mut lifecycle).await;
    }

    /// Re-read the config and respawn only if it changed.
    ///
    /// Removing the registry entry stops the server and forgets the
    /// fingerprint.
    pub async fn restart(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        let Some(config) = self.store.get(&self.server).await else {
            if self.state() != ProcessState::Stopped {
                info!(server = %self.server, "Tool server removed from settings, stopping");
            }
            self.halt(&mut lifecycle).await;
            return Ok(());
        };

        let fingerprint = ConfigFingerprint::of(&config);
        if self.is_running() && lifecycle.fingerprint.as_ref() == Some(&fingerprint) {
            debug!(server = %self.server, %fingerprint, "Config unchanged, keeping tool server");
            self.metrics.inc_restarts_skipped();
            return Ok(());
        }

        self.halt(&mut lifecycle).await;
        self.metrics.inc_restarts();
        self.launch(&mut lifecycle, config).await
    }

    /// Issue `tools/call` against the running server.
    ///
    /// Fails with [`Error::NotRunning`] without touching any process when the
    /// server is not up. Timeouts are returned to the caller, never retried.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value> {
        let conn = {
            let slot = self.slot();
            match (slot.state, &slot.connection) {
                (ProcessState::Running, Some(conn)) => conn.clone(),
                _ => return Err(Error::not_running(&self.server)),
            }
        };

        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let params = json!({ "name": tool, "arguments": arguments });

        self.metrics.inc_tool_calls();
        let result = conn
            .request("tools/call", Some(params), self.options.call_timeout)
            .await;

        if let Err(e) = &result {
            self.metrics.inc_tool_call_failures();
            if matches!(e, Error::CallTimeout { .. }) {
                self.metrics.inc_call_timeouts();
            }
            warn!(server = %self.server, tool, "Tool call failed: {}", e);
        }
        result
    }

    async fn launch(&self, lifecycle: &mut Lifecycle, config: ToolServerConfig) -> Result<()> {
        let fingerprint = ConfigFingerprint::of(&config);
        self.set_state(ProcessState::Starting);
        info!(
            server = %self.server,
            command = %config.command,
            %fingerprint,
            "Starting tool server"
        );

        let conn = match Connection::spawn(&self.server, &config) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(server = %self.server, "Spawn failed: {}", e);
                self.set_state(ProcessState::Stopped);
                return Err(e);
            }
        };
        self.metrics.inc_spawns();

        if let Err(e) = handshake::initialize(
            &conn,
            &self.options.client_info,
            self.options.handshake_timeout,
        )
        .await
        {
            warn!(server = %self.server, "Handshake failed, killing process: {}", e);
            self.metrics.inc_handshake_failures();
            conn.shutdown().await;
            self.set_state(ProcessState::Stopped);
            return Err(e);
        }

        {
            let mut slot = self.slot();
            slot.state = ProcessState::Running;
            slot.connection = Some(conn.clone());
        }
        lifecycle.fingerprint = Some(fingerprint);
        self.metrics.set_running(true);

        tokio::spawn(watch_exit(
            self.slot.clone(),
            conn,
            self.metrics.clone(),
        ));
        Ok(())
    }

    async fn halt(&self, lifecycle: &mut Lifecycle) {
        lifecycle.fingerprint = None;
        let conn = {
            let mut slot = self.slot();
            if slot.state == ProcessState::Stopped && slot.connection.is_none() {
                return;
            }
            slot.state = ProcessState::Stopping;
            slot.connection.take()
        };

        if let Some(conn) = conn {
            info!(server = %self.server, pid = conn.pid(), "Stopping tool server");
            conn.shutdown().await;
        }
        self.set_state(ProcessState::Stopped);
        self.metrics.set_running(false);
    }

    fn set_state(&self, state: ProcessState) {
        self.slot().state = state;
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flip the supervisor to `Stopped` if `conn` dies while it is current.
async fn watch_exit(slot: Arc<StdMutex<Slot>>, conn: Arc<Connection>, metrics: Arc<Metrics>) {
    conn.exited().await;

    let crashed = {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let current = slot
            .connection
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &conn));
        if current {
            slot.connection = None;
            slot.state = ProcessState::Stopped;
        }
        current
    };

    if crashed {
        warn!(server = conn.server(), pid = conn.pid(), "Tool server exited unexpectedly");
        metrics.inc_process_exits();
        metrics.set_running(false);
        conn.shutdown().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn sh(script: &str) -> ToolServerConfig {
        ToolServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..ToolServerConfig::default()
        }
    }

    /// Answers initialize, swallows the notification, then echoes a fixed
    /// tool result for every further line.
    const FAKE: &str = r#"read init; echo '{"id":1,"result":{}}'; read note; n=2; while read line; do echo "{\"id\":$n,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"[]\"}]}}"; n=$((n+1)); done"#;

    fn supervisor_with(config: Option<ToolServerConfig>) -> (Supervisor, Arc<SettingsStore>, Arc<Metrics>) {
        let mut settings = Settings::default();
        if let Some(config) = config {
            settings.mcp_servers.insert("cron".to_string(), config);
        }
        let store = Arc::new(SettingsStore::in_memory(settings));
        let metrics = Metrics::new();
        let options = SupervisorOptions {
            handshake_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
            ..SupervisorOptions::default()
        };
        let supervisor = Supervisor::new("cron", store.clone(), options, metrics.clone());
        (supervisor, store, metrics)
    }

    #[tokio::test]
    async fn test_start_without_config_is_noop() {
        let (supervisor, _, metrics) = supervisor_with(None);
        supervisor.start().await.unwrap();

        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert_eq!(metrics.snapshot().process_spawns, 0);
    }

    #[tokio::test]
    async fn test_call_when_stopped_is_not_running() {
        let (supervisor, _, metrics) = supervisor_with(Some(sh(FAKE)));

        let err = supervisor.call("list_tasks", json!({})).await.unwrap_err();
        assert!(err.is_not_running());
        assert_eq!(metrics.snapshot().process_spawns, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (supervisor, _, metrics) = supervisor_with(Some(sh(FAKE)));

        supervisor.start().await.unwrap();
        let pid = supervisor.pid();
        supervisor.start().await.unwrap();

        assert!(supervisor.is_running());
        assert_eq!(supervisor.pid(), pid);
        assert_eq!(metrics.snapshot().process_spawns, 1);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (supervisor, _, _) = supervisor_with(Some(sh(FAKE)));
        supervisor.start().await.unwrap();

        let result = supervisor.call("list_tasks", Value::Null).await.unwrap();
        assert_eq!(result["content"][0]["text"], "[]");
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_resets_to_stopped() {
        let (supervisor, _, metrics) = supervisor_with(Some(sh("cat > /dev/null")));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout { .. }));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.fingerprint().await.is_none());
        assert_eq!(metrics.snapshot().handshake_failures, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_resets_to_stopped() {
        let (supervisor, _, _) = supervisor_with(Some(ToolServerConfig::new("/no/such/binary")));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_safe_to_repeat() {
        let (supervisor, _, _) = supervisor_with(Some(sh(FAKE)));
        supervisor.stop().await;

        supervisor.start().await.unwrap();
        tokio::join!(supervisor.stop(), supervisor.stop());
        supervisor.stop().await;

        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_restart_skips_unchanged_config() {
        let (supervisor, _, metrics) = supervisor_with(Some(sh(FAKE)));

        supervisor.restart().await.unwrap();
        let pid = supervisor.pid();
        supervisor.restart().await.unwrap();

        assert_eq!(supervisor.pid(), pid);
        let s = metrics.snapshot();
        assert_eq!(s.process_spawns, 1);
        assert_eq!(s.restarts_skipped, 1);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_respawns_on_change() {
        let (supervisor, store, metrics) = supervisor_with(Some(sh(FAKE)));

        supervisor.restart().await.unwrap();
        let before = supervisor.fingerprint().await;

        let mut changed = sh(FAKE);
        changed.env.insert("TZ".to_string(), "UTC".to_string());
        store.upsert("cron", changed).await.unwrap();
        supervisor.restart().await.unwrap();

        assert!(supervisor.is_running());
        assert_ne!(supervisor.fingerprint().await, before);
        assert_eq!(metrics.snapshot().process_spawns, 2);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_removal_stops() {
        let (supervisor, store, _) = supervisor_with(Some(sh(FAKE)));
        supervisor.restart().await.unwrap();

        store.remove("cron").await.unwrap();
        supervisor.restart().await.unwrap();

        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.fingerprint().await.is_none());
    }

    #[tokio::test]
    async fn test_crash_transitions_to_stopped() {
        // Exits right after the handshake completes.
        let (supervisor, _, metrics) =
            supervisor_with(Some(sh(r#"read init; echo '{"id":1,"result":{}}'; read note; exit 1"#)));

        supervisor.start().await.unwrap();
        for _ in 0..200 {
            if !supervisor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert_eq!(metrics.snapshot().process_exits, 1);
        let err = supervisor.call("list_tasks", json!({})).await.unwrap_err();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_crash_noticed_when_helper_keeps_stdout_open() {
        // A leftover background helper holds stdout, so only the child's
        // own exit reveals the crash.
        let (supervisor, _, metrics) = supervisor_with(Some(sh(
            r#"sleep 5 & read init; echo '{"id":1,"result":{}}'; read note; exit 1"#,
        )));

        supervisor.start().await.unwrap();
        for _ in 0..150 {
            if !supervisor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert_eq!(metrics.snapshot().process_exits, 1);
    }
}

//! A spawned tool server and its JSON-RPC plumbing.
//!
//! One [`Connection`] owns the table of requests waiting for a reply and
//! three background tasks: a writer that is the only thing touching the
//! child's stdin, a reader that drains stdout through the [`Framer`] and
//! routes each response to its waiter by id, and a waiter that owns the
//! [`Child`] and notices when it exits. Concurrent requests can complete
//! in any order.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ToolServerConfig;
use crate::error::{Error, Result};
use crate::mcp::framer::{encode_line, Framer};
use crate::mcp::protocol::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};

const READ_CHUNK: usize = 8 * 1024;

/// Lines queued for stdin before senders start waiting.
const OUTGOING_CAPACITY: usize = 64;

/// How long a dead child's stdout may keep delivering buffered replies.
const EXIT_GRACE: Duration = Duration::from_millis(200);

type Reply = oneshot::Sender<Result<Value>>;

/// Why a connection stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Exited,
    Stopped,
}

/// A live tool server process.
pub struct Connection {
    server: String,
    pid: Option<u32>,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: DashMap<i64, Reply>,
    next_id: AtomicI64,
    closed: OnceLock<CloseReason>,
    exited: watch::Sender<bool>,
    kill: StdMutex<Option<oneshot::Sender<()>>>,
    io_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Spawn `config` and start the background tasks.
    ///
    /// The process is not usable for tool calls until the handshake has run.
    pub fn spawn(server: &str, config: &ToolServerConfig) -> Result<Arc<Self>> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            server: server.to_string(),
            reason: e.to_string(),
        })?;

        let missing = |pipe: &str| Error::Spawn {
            server: server.to_string(),
            reason: format!("failed to capture {}", pipe),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let conn = Arc::new(Self {
            server: server.to_string(),
            pid,
            outgoing: outgoing_tx,
            pending: DashMap::new(),
            next_id: AtomicI64::new(1),
            closed: OnceLock::new(),
            exited: watch::Sender::new(false),
            kill: StdMutex::new(Some(kill_tx)),
            io_tasks: StdMutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(server.to_string(), stdin, outgoing_rx));
        let reader = tokio::spawn(read_loop(Arc::downgrade(&conn), stdout));
        conn.io_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([writer, reader]);
        tokio::spawn(wait_child(Arc::downgrade(&conn), server.to_string(), child, kill_rx));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(server.to_string(), stderr));
        }

        debug!(server, pid, "Spawned tool server");
        Ok(conn)
    }

    /// Registry key of the server this connection runs.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the connection has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its reply, at most `timeout`.
    ///
    /// The deadline covers queueing, writing and waiting. A timeout only
    /// abandons this request; the stream and every other in-flight request
    /// are untouched, and the writer task never leaves a partial line.
    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_line(&JsonRpcRequest::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard { conn: self, id };

        // Closing may have swept the table just before the insert.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let exchange = async {
            self.outgoing
                .send(line)
                .await
                .map_err(|_| self.closed_error())?;
            trace!(server = %self.server, id, method, "Queued request");
            rx.await.unwrap_or_else(|_| Err(self.closed_error()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                debug!(server = %self.server, id, method, "Request timed out");
                Err(Error::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification. Nothing comes back.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let line = encode_line(&JsonRpcNotification::new(method, params))?;
        self.outgoing
            .send(line)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Wait until the child has exited, stdout has closed, or the
    /// connection was shut down.
    pub async fn exited(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|&done| done).await;
    }

    /// Kill the child and fail every outstanding request with `ServerStopped`.
    ///
    /// Returns once the kill is requested; reaping happens in the background.
    pub async fn shutdown(&self) {
        let _ = self.closed.set(CloseReason::Stopped);
        self.fail_pending();

        let tasks: Vec<JoinHandle<()>> = self
            .io_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        self.exited.send_replace(true);
    }

    fn closed_error(&self) -> Error {
        let server = self.server.clone();
        match self.closed.get() {
            Some(CloseReason::Stopped) => Error::ServerStopped { server },
            _ => Error::ProcessExited { server },
        }
    }

    /// Reject every pending request in one pass.
    fn fail_pending(&self) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(self.closed_error()));
            }
        }
    }

    fn mark_exited(&self) {
        let _ = self.closed.set(CloseReason::Exited);
        self.fail_pending();
        self.exited.send_replace(true);
    }

    /// Queue a reply to a server-initiated request without waiting.
    fn queue<T: Serialize>(&self, msg: &T) -> Result<()> {
        let line = encode_line(msg)?;
        self.outgoing
            .try_send(line)
            .map_err(|e| Error::McpProtocol(format!("outgoing queue unavailable: {}", e)))
    }

    fn complete(&self, id: RequestId, reply: Result<Value>) {
        let RequestId::Number(num) = id else {
            debug!(server = %self.server, %id, "Dropping response with foreign id");
            return;
        };
        match self.pending.remove(&num) {
            Some((_, waiter)) => {
                let _ = waiter.send(reply);
            }
            None => debug!(server = %self.server, id = num, "Dropping response for unknown request"),
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg {
            Message::Success { id, result } => self.complete(id, Ok(result)),
            Message::Failure { id, error } => self.complete(
                id,
                Err(Error::Rpc {
                    code: error.code,
                    message: error.message,
                }),
            ),
            Message::Request(req) => {
                let reply = if req.method == "ping" {
                    JsonRpcResponse::success(req.id, json!({}))
                } else {
                    JsonRpcResponse::failure(
                        req.id,
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", req.method),
                    )
                };
                if let Err(e) = self.queue(&reply) {
                    debug!(server = %self.server, "Failed to answer server request: {}", e);
                }
            }
            Message::Notification(notif) => {
                debug!(server = %self.server, method = %notif.method, "Ignoring server notification");
            }
        }
    }
}

/// Removes the pending entry if the waiting future is dropped or times out.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.pending.remove(&self.id);
    }
}

/// Sole writer of the child's stdin. Each line is written whole.
async fn write_loop(server: String, mut stdin: ChildStdin, mut lines: mpsc::Receiver<Vec<u8>>) {
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            debug!(server = %server, "Error writing to tool server stdin: {}", e);
            break;
        }
    }
}

async fn read_loop(conn: Weak<Connection>, mut stdout: ChildStdout) {
    let mut framer = Framer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Error reading tool server stdout: {}", e);
                break;
            }
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };
        for msg in framer.push(&chunk[..n]) {
            conn.dispatch(msg);
        }
    }

    if let Some(conn) = conn.upgrade() {
        debug!(server = %conn.server, "Tool server stdout closed");
        conn.mark_exited();
    }
}

/// Own the child until it exits or a kill is requested, then reap it.
///
/// Dropping the kill sender counts as a kill request.
async fn wait_child(
    conn: Weak<Connection>,
    server: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!(server = %server, "Kill failed (process already gone?): {}", e);
            }
            child.wait().await
        }
    };
    match &status {
        Ok(status) => debug!(server = %server, %status, "Tool server reaped"),
        Err(e) => debug!(server = %server, "Failed to reap tool server: {}", e),
    }

    let Some(conn) = conn.upgrade() else {
        return;
    };
    if !conn.is_closed() {
        // Replies already in the pipe still reach their callers.
        let _ = tokio::time::timeout(EXIT_GRACE, conn.exited()).await;
        conn.mark_exited();
    }
}

async fn forward_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server, "stderr: {}", line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolServerConfig {
        ToolServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..ToolServerConfig::default()
        }
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_request_gets_matching_response() {
        let conn = Connection::spawn(
            "test",
            &sh(r#"read line; echo 'noise'; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; cat > /dev/null"#),
        )
        .unwrap();

        let result = conn.request("ping", None, LONG).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(conn.pending_count(), 0);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_forwarded() {
        let conn = Connection::spawn(
            "test",
            &sh(r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"no such task"}}'; cat > /dev/null"#),
        )
        .unwrap();

        match conn.request("tools/call", None, LONG).await {
            Err(Error::Rpc { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "no such task");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched_by_id() {
        let conn = Connection::spawn(
            "test",
            &sh(r#"read a; read b; echo '{"id":2,"result":"second"}'; echo '{"id":1,"result":"first"}'; cat > /dev/null"#),
        )
        .unwrap();

        let (first, second) = tokio::join!(
            conn.request("a", None, LONG),
            conn.request("b", None, LONG)
        );
        assert_eq!(first.unwrap(), json!("first"));
        assert_eq!(second.unwrap(), json!("second"));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_keeps_stream() {
        let conn = Connection::spawn(
            "test",
            &sh(r#"read a; read b; echo '{"id":2,"result":"late but fine"}'; cat > /dev/null"#),
        )
        .unwrap();

        let err = conn
            .request("slow", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallTimeout { .. }));
        assert!(err.to_string().contains("MCP response timeout"));
        assert_eq!(conn.pending_count(), 0);

        let ok = conn.request("fast", None, LONG).await.unwrap();
        assert_eq!(ok, json!("late but fine"));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_exit_rejects_pending() {
        let conn = Connection::spawn("test", &sh("read line; exit 0")).unwrap();

        let err = conn.request("anything", None, LONG).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }));

        conn.exited().await;
        assert!(conn.is_closed());
        let err = conn.request("again", None, LONG).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_in_flight_with_stopped() {
        let conn = Connection::spawn("test", &sh("cat > /dev/null")).unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("never", None, LONG).await })
        };
        while conn.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        conn.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ServerStopped { .. }));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        // The server pings us first and only answers our request once it
        // has seen our reply to its ping among the next two lines.
        let conn = Connection::spawn(
            "test",
            &sh(r#"echo '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'; read a; read b; case "$a$b" in *srv-1*) echo '{"id":1,"result":"pong seen"}';; esac; cat > /dev/null"#),
        )
        .unwrap();

        let result = conn.request("check", None, LONG).await.unwrap();
        assert_eq!(result, json!("pong seen"));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_holds_when_server_stops_reading() {
        // The child never reads stdin, so a payload larger than the pipe
        // buffer can never be fully written.
        let conn = Connection::spawn("test", &sh("sleep 30")).unwrap();
        let blob = "x".repeat(1024 * 1024);

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            conn.request("tools/call", Some(json!({ "blob": blob })), Duration::from_millis(200)),
        )
        .await
        .expect("request deadline was not enforced");
        assert!(matches!(outcome, Err(Error::CallTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));

        // A second call is not stuck behind the blocked write.
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            conn.request("small", None, Duration::from_millis(200)),
        )
        .await
        .expect("second request deadline was not enforced");
        assert!(matches!(outcome, Err(Error::CallTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.pending_count(), 0);

        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_tear_next_line() {
        // Only answers a line carrying id 2, so a torn first line glued
        // onto the second would leave it unanswered.
        let conn = Connection::spawn(
            "test",
            &sh(r#"while read line; do case "$line" in *'"id":2'*) echo '{"id":2,"result":"intact"}';; esac; done"#),
        )
        .unwrap();

        let blob = "y".repeat(256 * 1024);
        let first = conn.request("big", Some(json!({ "blob": blob })), LONG);
        let _ = tokio::time::timeout(Duration::from_millis(1), first).await;

        let result = conn.request("after", None, LONG).await.unwrap();
        assert_eq!(result, json!("intact"));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_detected_while_stdout_held_open() {
        // The background sleep inherits stdout, so no EOF arrives when the
        // shell itself exits.
        let conn = Connection::spawn("test", &sh("sleep 5 & read line; exit 1")).unwrap();

        let err = conn.request("anything", None, LONG).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }), "got {:?}", err);

        tokio::time::timeout(Duration::from_secs(2), conn.exited())
            .await
            .expect("child exit was not noticed");
        assert!(conn.is_closed());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = Connection::spawn("test", &ToolServerConfig::new("/definitely/not/here")).err();
        assert!(matches!(err, Some(Error::Spawn { .. })));
    }
}

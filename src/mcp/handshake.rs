//! The MCP `initialize` / `notifications/initialized` exchange.

use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mcp::connection::Connection;
use crate::mcp::protocol::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, MCP_VERSION,
};

/// Client identity sent in `initialize`.
pub fn client_info() -> Implementation {
    Implementation {
        name: "assistant-bridge".to_string(),
        version: crate::VERSION.to_string(),
    }
}

/// Bring a freshly spawned server to the ready state.
///
/// Sends `initialize`, waits up to `timeout` for its reply, then fires the
/// `notifications/initialized` notification. A missing reply surfaces as
/// [`Error::HandshakeTimeout`]; the caller owns killing the process.
pub async fn initialize(
    conn: &Connection,
    client: &Implementation,
    timeout: Duration,
) -> Result<InitializeResult> {
    let params = InitializeParams {
        protocol_version: MCP_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: client.clone(),
    };

    let raw = conn
        .request("initialize", Some(serde_json::to_value(params)?), timeout)
        .await
        .map_err(|e| match e {
            Error::CallTimeout { timeout_ms, .. } => Error::HandshakeTimeout {
                server: conn.server().to_string(),
                timeout_ms,
            },
            other => other,
        })?;

    let result: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| Error::McpProtocol(format!("invalid initialize result: {}", e)))?;

    if !result.protocol_version.is_empty() && result.protocol_version != MCP_VERSION {
        debug!(
            server = conn.server(),
            "Server negotiated protocol {} (we offered {})",
            result.protocol_version,
            MCP_VERSION
        );
    }

    conn.notify("notifications/initialized", None).await?;

    match &result.server_info {
        Some(info) => info!(
            server = conn.server(),
            pid = conn.pid(),
            "Connected to {} {}",
            info.name,
            info.version
        ),
        None => info!(server = conn.server(), pid = conn.pid(), "Connected to tool server"),
    }
    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ToolServerConfig;

    fn sh(script: &str) -> ToolServerConfig {
        ToolServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..ToolServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized_notification() {
        // Reply to initialize, then echo back whatever arrives next so the
        // test can see the notification on the wire.
        let conn = Connection::spawn(
            "cron",
            &sh(r#"read init; echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"9"}}}'; read note; case "$note" in *notifications/initialized*) read req; echo '{"id":2,"result":"ready"}';; esac; cat > /dev/null"#),
        )
        .unwrap();

        let result = initialize(&conn, &client_info(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.server_info.unwrap().name, "fake");

        let after = conn
            .request("probe", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(after, serde_json::json!("ready"));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let conn = Connection::spawn("cron", &sh("cat > /dev/null")).unwrap();

        let started = std::time::Instant::now();
        let err = initialize(&conn, &client_info(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HandshakeTimeout { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_error_is_surfaced() {
        let conn = Connection::spawn(
            "cron",
            &sh(r#"read init; echo '{"id":1,"error":{"code":-32603,"message":"boot failed"}}'; cat > /dev/null"#),
        )
        .unwrap();

        let err = initialize(&conn, &client_info(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc { code: -32603, .. }));
        conn.shutdown().await;
    }
}

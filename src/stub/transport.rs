//! Stdio transport for the stub server.
//!
//! Reader and writer run as separate tasks connected by channels, so
//! handlers can answer from any task and slow tools never block reads.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::mcp::framer::{encode_line, Framer};
use crate::mcp::protocol::{JsonRpcResponse, Message};

/// Start stdin/stdout pumps.
///
/// Returns the incoming and outgoing channels plus the writer task, which
/// finishes once every clone of the outgoing sender has been dropped.
pub fn start() -> (
    mpsc::Receiver<Message>,
    mpsc::Sender<JsonRpcResponse>,
    JoinHandle<()>,
) {
    // Channel for incoming messages (from stdin)
    let (incoming_tx, incoming_rx) = mpsc::channel::<Message>(100);
    // Channel for outgoing responses (to stdout)
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcResponse>(100);

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut framer = Framer::new();
        let mut chunk = vec![0u8; 4096];

        loop {
            match stdin.read(&mut chunk).await {
                Ok(0) => {
                    debug!("EOF on stdin, stopping transport");
                    break;
                }
                Ok(n) => {
                    for msg in framer.push(&chunk[..n]) {
                        if incoming_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();

        while let Some(response) = outgoing_rx.recv().await {
            let line = match encode_line(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!("Error serializing response: {}", e);
                    continue;
                }
            };
            trace!("Sending: {}", String::from_utf8_lossy(&line).trim_end());
            if let Err(e) = stdout.write_all(&line).await {
                error!("Error writing to stdout: {}", e);
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!("Error flushing stdout: {}", e);
                break;
            }
        }
    });

    (incoming_rx, outgoing_tx, writer)
}

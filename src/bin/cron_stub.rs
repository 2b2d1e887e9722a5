//! In-memory scheduled-task MCP server speaking JSON-RPC over stdio.
//!
//! Useful as a local stand-in for the real scheduler and as the child
//! process in integration tests.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use assistant_bridge::stub::{StubMode, StubServer};
use assistant_bridge::VERSION;

#[derive(Parser, Debug)]
#[command(name = "cron-stub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "In-memory scheduled-task MCP server over stdio")]
struct Args {
    /// Label reported by the `server_info` tool
    #[arg(long, default_value = "cron-stub", env = "CRON_STUB_LABEL")]
    label: String,

    /// Response behaviour
    #[arg(long, value_enum, default_value_t = StubMode::Normal)]
    mode: StubMode,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries protocol traffic, so logs go to stderr.
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("cron-stub v{} (label: {})", VERSION, args.label);

    StubServer::new(args.label, args.mode).run().await?;
    Ok(())
}

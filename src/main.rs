//! Assistant Bridge - HTTP backend supervising MCP tool servers.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assistant_bridge::bridge::{CronBridge, Supervisor, SupervisorOptions};
use assistant_bridge::config::{Args, Config, SettingsStore};
use assistant_bridge::error::Result;
use assistant_bridge::http::{self, HttpState};
use assistant_bridge::metrics::Metrics;
use assistant_bridge::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    let config: Config = args.into();

    info!("Assistant Bridge v{}", VERSION);
    info!("Settings: {:?}", config.settings_path);

    let settings = Arc::new(SettingsStore::load(&config.settings_path).await?);
    let metrics = Metrics::new();
    let supervisor = Supervisor::new(
        config.server_key.clone(),
        settings.clone(),
        SupervisorOptions::from(&config),
        metrics.clone(),
    );
    let bridge = Arc::new(CronBridge::new(supervisor));

    // A broken tool server must not keep the API from coming up.
    if let Err(e) = bridge.start().await {
        warn!("Scheduled-task server failed to start: {}", e);
    }

    let state = HttpState::new(bridge, settings, metrics);
    http::start_server(&config, state).await
}

//! Assistant Bridge
//!
//! Backend for a self-hosted personal assistant. The interesting part is
//! the supervision of MCP tool servers that run as child processes and
//! speak JSON-RPC over stdio.
//!
//! # Architecture
//!
//! 1. **MCP Layer** (`mcp`) - Line framing, request correlation, handshake
//! 2. **Bridge Layer** (`bridge`) - Process supervision, restart policy, tool-call façade
//! 3. **HTTP Layer** (`http`) - Task routes and tool-server settings
//! 4. **Stub** (`stub`) - In-memory scheduled-task server used in development and tests
//!
//! Ambient pieces: `config` (CLI and the tool-server registry), `metrics`
//! (counters exposed on `/metrics`), and `error`.

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod stub;

pub use error::{Error, Result};

/// Crate version, reported as `clientInfo.version` in the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

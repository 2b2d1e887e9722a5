//! Model Context Protocol (MCP) client plumbing.
//!
//! # Architecture
//!
//! - `protocol` - Core MCP types and message definitions
//! - `framer` - Newline-delimited JSON-RPC framing
//! - `connection` - Child process, pending requests, stdout demultiplexing
//! - `handshake` - `initialize` exchange run before any tool call

pub mod connection;
pub mod framer;
pub mod handshake;
pub mod protocol;

pub use connection::Connection;
pub use framer::Framer;
pub use protocol::*;

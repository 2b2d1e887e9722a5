//! Supervision of the scheduled-task ("cron") tool server.
//!
//! - `fingerprint` - Config digests deciding whether a restart is needed
//! - `supervisor` - Process lifecycle, restart policy, `tools/call`
//! - `facade` - [`CronBridge`], the API the HTTP layer talks to

pub mod facade;
pub mod fingerprint;
pub mod supervisor;

pub use facade::{unwrap_tool_result, CronBridge, ToolOutput};
pub use fingerprint::ConfigFingerprint;
pub use supervisor::{ProcessState, Supervisor, SupervisorOptions};

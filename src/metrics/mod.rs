//! Prometheus metrics for the tool-server bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Child processes spawned
    pub process_spawns: AtomicU64,
    /// Handshakes that failed or timed out
    pub handshake_failures: AtomicU64,
    /// Restarts that actually replaced the process
    pub restarts: AtomicU64,
    /// Restarts skipped because the config was unchanged
    pub restarts_skipped: AtomicU64,
    /// Tool calls issued
    pub tool_calls: AtomicU64,
    /// Tool calls that failed for any reason
    pub tool_call_failures: AtomicU64,
    /// Tool calls that hit their deadline
    pub call_timeouts: AtomicU64,
    /// Unexpected child exits
    pub process_exits: AtomicU64,
    /// 1 while the tool server is running
    pub running: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_spawns(&self) {
        self.process_spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_restarts_skipped(&self) {
        self.restarts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_call_failures(&self) {
        self.tool_call_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_call_timeouts(&self) {
        self.call_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_process_exits(&self) {
        self.process_exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the running gauge.
    pub fn set_running(&self, running: bool) {
        self.running.store(u64::from(running), Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            process_spawns: self.process_spawns.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            restarts_skipped: self.restarts_skipped.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_call_failures: self.tool_call_failures.load(Ordering::Relaxed),
            call_timeouts: self.call_timeouts.load(Ordering::Relaxed),
            process_exits: self.process_exits.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP assistant_bridge_process_spawns_total Tool server processes spawned
# TYPE assistant_bridge_process_spawns_total counter
assistant_bridge_process_spawns_total {}

# HELP assistant_bridge_handshake_failures_total Failed initialize handshakes
# TYPE assistant_bridge_handshake_failures_total counter
assistant_bridge_handshake_failures_total {}

# HELP assistant_bridge_restarts_total Restarts that replaced the process
# TYPE assistant_bridge_restarts_total counter
assistant_bridge_restarts_total {}

# HELP assistant_bridge_restarts_skipped_total Restarts skipped on unchanged config
# TYPE assistant_bridge_restarts_skipped_total counter
assistant_bridge_restarts_skipped_total {}

# HELP assistant_bridge_tool_calls_total Tool calls issued
# TYPE assistant_bridge_tool_calls_total counter
assistant_bridge_tool_calls_total {}

# HELP assistant_bridge_tool_call_failures_total Tool calls that failed
# TYPE assistant_bridge_tool_call_failures_total counter
assistant_bridge_tool_call_failures_total {}

# HELP assistant_bridge_call_timeouts_total Tool calls that timed out
# TYPE assistant_bridge_call_timeouts_total counter
assistant_bridge_call_timeouts_total {}

# HELP assistant_bridge_process_exits_total Unexpected tool server exits
# TYPE assistant_bridge_process_exits_total counter
assistant_bridge_process_exits_total {}

# HELP assistant_bridge_running Whether the tool server is running
# TYPE assistant_bridge_running gauge
assistant_bridge_running {}
"#,
            s.process_spawns,
            s.handshake_failures,
            s.restarts,
            s.restarts_skipped,
            s.tool_calls,
            s.tool_call_failures,
            s.call_timeouts,
            s.process_exits,
            s.running
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub process_spawns: u64,
    pub handshake_failures: u64,
    pub restarts: u64,
    pub restarts_skipped: u64,
    pub tool_calls: u64,
    pub tool_call_failures: u64,
    pub call_timeouts: u64,
    pub process_exits: u64,
    pub running: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc_spawns();
        metrics.inc_spawns();
        metrics.inc_tool_calls();
        metrics.inc_call_timeouts();

        let s = metrics.snapshot();
        assert_eq!(s.process_spawns, 2);
        assert_eq!(s.tool_calls, 1);
        assert_eq!(s.call_timeouts, 1);
        assert_eq!(s.restarts, 0);
    }

    #[test]
    fn test_running_gauge() {
        let metrics = Metrics::new();
        metrics.set_running(true);
        assert_eq!(metrics.snapshot().running, 1);
        metrics.set_running(false);
        assert_eq!(metrics.snapshot().running, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.inc_restarts_skipped();

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE assistant_bridge_running gauge"));
        assert!(text.contains("assistant_bridge_restarts_skipped_total 1"));
        assert!(text.contains("assistant_bridge_process_spawns_total 0"));
    }
}

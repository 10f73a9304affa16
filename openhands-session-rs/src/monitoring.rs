use std::time::Duration;
use tracing::info;

/// Receives lifecycle metrics from sessions.
pub trait MonitoringListener: Send + Sync {
    /// Called exactly once per `start`, whatever its outcome.
    fn on_agent_session_start(&self, success: bool, duration: Duration);

    fn on_agent_session_close(&self, _sid: &str) {}
}

/// Reports to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitoringListener;

impl MonitoringListener for TracingMonitoringListener {
    fn on_agent_session_start(&self, success: bool, duration: Duration) {
        info!(
            success,
            duration_ms = duration.as_millis() as u64,
            "Agent session start finished"
        );
    }

    fn on_agent_session_close(&self, sid: &str) {
        info!(sid, "Agent session closed");
    }
}

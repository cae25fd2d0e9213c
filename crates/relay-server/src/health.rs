//! `/health` endpoint body.

use std::time::Instant;

use relay_telemetry::MetricsSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub uptime_secs: u64,
    /// Connections currently in the hub registry.
    pub connections: usize,
    pub metrics: MetricsSnapshot,
}

pub fn health_check(start_time: Instant, connections: usize, metrics: MetricsSnapshot) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        metrics,
    }
}

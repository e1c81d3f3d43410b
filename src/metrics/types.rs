use chrono::{DateTime, Utc};
use serde::Serialize;

/// Timing record for one sampling tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMetrics {
    pub at: DateTime<Utc>,
    pub telemetry_ms: u64,
    pub persist_ms: u64,
    pub publish_ms: u64,
    /// True when the tick was forced by a screen/power event rather than
    /// the cadence.
    pub event_driven: bool,
}

/// The daemon's own resource footprint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_ticks: Vec<TickMetrics>,
    pub sample_count: u64,
    pub event_refresh_count: u64,
}

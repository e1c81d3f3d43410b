use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::monitor::{ClosedWindow, WindowEndReason};

/// One archived discharge window, as stored in SQLite.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DischargeWindow {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: WindowEndReason,
    pub window_ms: u64,
    pub screen_on_ms: u64,
    pub consumed_on_uah: u64,
    pub consumed_off_uah: u64,
    pub drop_on_pct: f64,
    pub drop_off_pct: f64,
}

impl DischargeWindow {
    pub fn from_closed(closed: &ClosedWindow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: closed.started_at,
            ended_at: closed.ended_at,
            end_reason: closed.reason,
            window_ms: closed.window_ms,
            screen_on_ms: closed.screen_on_ms,
            consumed_on_uah: closed.consumed_on_uah,
            consumed_off_uah: closed.consumed_off_uah,
            drop_on_pct: closed.drop_on_pct,
            drop_off_pct: closed.drop_off_pct,
        }
    }
}

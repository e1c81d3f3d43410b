use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use crate::monitor::DerivedMetrics;

/// The per-tick status output: a one-line title and a multi-line body, the
/// daemon's stand-in for an ongoing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    pub title: String,
    pub body: String,
}

/// Percentage with two decimals, promoted to a flat "100.0" at the top so a
/// full battery never renders as "99.99"-ish noise.
pub fn format_percent(value: f64) -> String {
    if value >= 99.995 {
        "100.0".to_string()
    } else {
        format!("{value:.2}")
    }
}

/// Adaptive duration: seconds, then minutes, then hours.
pub fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Drain rate. An empty bucket reports exactly "0% /hr".
pub fn format_rate_pct_per_hr(rate: f64) -> String {
    if rate <= 0.0 {
        "0% /hr".to_string()
    } else {
        format!("{rate:.2}% /hr")
    }
}

pub fn build_payload(metrics: &DerivedMetrics) -> StatusPayload {
    let level = match metrics.level_pct {
        Some(level) => format!("{}%", format_percent(level)),
        None => "--%".to_string(),
    };

    let mut title = format!("{} {}", metrics.status.as_str(), level);
    if let Some(current_ma) = metrics.current_ma {
        title.push_str(&format!(" · {current_ma:.0} mA"));
    }
    if let Some(temp_c) = metrics.temp_c {
        title.push_str(&format!(" · {temp_c:.1}°C"));
    }

    let mut lines = vec![
        format!(
            "Screen on {} · drain {}",
            format_duration_ms(metrics.screen_on_ms),
            format_rate_pct_per_hr(metrics.active_rate_pct_per_hr)
        ),
        format!(
            "Screen off {} · drain {}",
            format_duration_ms(metrics.screen_off_ms),
            format_rate_pct_per_hr(metrics.idle_rate_pct_per_hr)
        ),
        format!(
            "Awake {} · deep sleep {}",
            format_duration_ms(metrics.awake_ms),
            format_duration_ms(metrics.deep_sleep_ms)
        ),
        format!(
            "Consumed {:.1} mAh on / {:.1} mAh off",
            metrics.consumed_on_mah, metrics.consumed_off_mah
        ),
    ];
    if metrics.charging {
        lines.push("Charging (accounting paused)".to_string());
    }

    StatusPayload {
        title,
        body: lines.join("\n"),
    }
}

pub trait StatusSink: Send {
    fn publish(&mut self, payload: &StatusPayload) -> Result<()>;
}

/// Rewrites a small status file atomically on every tick and mirrors the
/// title to the log.
pub struct FileStatusSink {
    path: PathBuf,
}

impl FileStatusSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatusSink for FileStatusSink {
    fn publish(&mut self, payload: &StatusPayload) -> Result<()> {
        let rendered = format!("{}\n{}\n", payload.title, payload.body);
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, rendered)
            .with_context(|| format!("failed to write status to {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move status into {}", self.path.display()))?;
        info!("{}", payload.title);
        Ok(())
    }
}

use chrono::{DateTime, Duration, Utc};

use crate::persist::PersistedAccountingState;
use crate::telemetry::{derive_capacity_uah, BatterySnapshot, ChargeStatus};

use super::window::AccumulatedWindow;

/// Exponential smoothing weight for the newest current reading.
const CURRENT_NEW_WEIGHT: f64 = 0.6;

/// One observation fed to the attribution engine.
#[derive(Debug, Clone)]
pub struct Sample {
    pub elapsed_ms: u64,
    pub uptime_ms: u64,
    pub wall: DateTime<Utc>,
    pub battery: BatterySnapshot,
    pub interactive: bool,
}

/// Memory of the previous sample. Attribution assigns the inter-sample
/// delta to the interactivity recorded here, not to the state just entered.
#[derive(Debug, Clone, Copy)]
struct PrevSample {
    elapsed_ms: u64,
    level_pct: Option<f64>,
    charge_uah: Option<i64>,
    interactive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WindowEndReason {
    Charging,
    Reset,
}

impl WindowEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowEndReason::Charging => "Charging",
            WindowEndReason::Reset => "Reset",
        }
    }
}

/// Final accounting of a discharge window, produced when charging resumes
/// or the user resets.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub window_ms: u64,
    pub screen_on_ms: u64,
    pub consumed_on_uah: u64,
    pub consumed_off_uah: u64,
    pub drop_on_pct: f64,
    pub drop_off_pct: f64,
    pub reason: WindowEndReason,
}

/// Everything the status payload needs, derived once per sample.
#[derive(Debug, Clone)]
pub struct DerivedMetrics {
    pub level_pct: Option<f64>,
    pub status: ChargeStatus,
    pub charging: bool,
    pub interactive: bool,
    pub current_ma: Option<f64>,
    pub voltage_v: Option<f64>,
    pub temp_c: Option<f64>,
    pub window_ms: u64,
    pub screen_on_ms: u64,
    pub screen_off_ms: u64,
    pub awake_ms: u64,
    pub deep_sleep_ms: u64,
    pub consumed_on_mah: f64,
    pub consumed_off_mah: f64,
    pub drop_on_pct: f64,
    pub drop_off_pct: f64,
    pub active_rate_pct_per_hr: f64,
    pub idle_rate_pct_per_hr: f64,
}

pub struct SampleOutcome {
    pub metrics: DerivedMetrics,
    /// Present when this sample ended a live discharge window.
    pub closed_window: Option<ClosedWindow>,
}

/// The battery accounting state machine. Owns the discharge window and the
/// previous-sample memory; all mutation funnels through `apply`, the event
/// handlers, and `reset`.
pub struct SampleEngine {
    window: AccumulatedWindow,
    prev: Option<PrevSample>,
    smoothed_current_ua: Option<f64>,
    design_capacity_uah: Option<i64>,
}

impl SampleEngine {
    pub fn new(design_capacity_uah: Option<i64>) -> Self {
        Self {
            window: AccumulatedWindow::default(),
            prev: None,
            smoothed_current_ua: None,
            design_capacity_uah,
        }
    }

    pub fn window(&self) -> &AccumulatedWindow {
        &self.window
    }

    /// Feed one sample through the attribution state machine.
    pub fn apply(&mut self, sample: &Sample) -> SampleOutcome {
        let charging = sample.battery.is_charging();
        self.learn_capacity(&sample.battery);
        self.smooth_current(&sample.battery, charging);
        let level = self.level_pct(&sample.battery);

        let mut closed_window = None;
        if charging {
            if self.window.is_open() {
                closed_window =
                    Some(self.close_window(sample.elapsed_ms, sample.wall, WindowEndReason::Charging));
            }
            self.window.reset_for_charging();
            self.prev = None;
        } else {
            if !self.window.is_open() {
                self.window.begin_discharge(
                    sample.elapsed_ms,
                    sample.uptime_ms,
                    sample.wall,
                    sample.interactive,
                );
            } else if sample.interactive {
                // Keep the open marker in step with the probe even when the
                // edge event was missed.
                self.window.note_screen_on(sample.elapsed_ms);
            } else {
                self.window.fold_screen_off(sample.elapsed_ms);
            }

            if let Some(prev) = self.prev {
                let dt_ms = sample.elapsed_ms.saturating_sub(prev.elapsed_ms);
                if dt_ms > 0 {
                    if let (Some(prev_charge), Some(charge)) =
                        (prev.charge_uah, sample.battery.charge_counter_uah)
                    {
                        let delta_uah = (prev_charge - charge).max(0) as u64;
                        self.window.add_consumed(prev.interactive, delta_uah);
                    }
                    if let (Some(prev_level), Some(level)) = (prev.level_pct, level) {
                        let delta_pct = (prev_level - level).max(0.0);
                        self.window.add_drop(prev.interactive, delta_pct);
                    }
                }
            }

            self.prev = Some(PrevSample {
                elapsed_ms: sample.elapsed_ms,
                level_pct: level,
                charge_uah: sample.battery.charge_counter_uah,
                interactive: sample.interactive,
            });
        }

        SampleOutcome {
            metrics: self.derived(sample, level, charging),
            closed_window,
        }
    }

    /// Screen-on edge (or unlock): open an on-period.
    pub fn handle_screen_on(&mut self, now_elapsed_ms: u64) {
        if self.window.is_open() {
            self.window.note_screen_on(now_elapsed_ms);
        }
    }

    /// Screen-off edge: fold the open on-period into the accumulator.
    pub fn handle_screen_off(&mut self, now_elapsed_ms: u64) {
        if self.window.is_open() {
            self.window.fold_screen_off(now_elapsed_ms);
        }
    }

    /// Explicit user reset: close the live window (if any) and restart
    /// accounting immediately, regardless of charge state.
    pub fn reset(
        &mut self,
        elapsed_ms: u64,
        uptime_ms: u64,
        wall: DateTime<Utc>,
        interactive: bool,
    ) -> Option<ClosedWindow> {
        let closed = self
            .window
            .is_open()
            .then(|| self.close_window(elapsed_ms, wall, WindowEndReason::Reset));
        self.window
            .begin_discharge(elapsed_ms, uptime_ms, wall, interactive);
        self.prev = None;
        closed
    }

    /// The subset of state that survives process death, with the open
    /// screen-on period folded forward to now.
    pub fn persisted_state(&self, now_elapsed_ms: u64) -> PersistedAccountingState {
        PersistedAccountingState {
            screen_accumulator_ms: self.window.screen_on_ms(now_elapsed_ms),
            last_persisted_elapsed_ms: now_elapsed_ms,
            window_start_elapsed_ms: self.window.start_elapsed_ms,
            window_start_uptime_ms: self.window.start_uptime_ms,
        }
    }

    /// Adopt a previously persisted window. Returns false (leaving the
    /// engine fresh) when the stored state predates a reboot or was never
    /// written; a monotonic clock that went backwards cannot be trusted to
    /// produce sane deltas.
    pub fn restore(
        &mut self,
        state: &PersistedAccountingState,
        now_elapsed_ms: u64,
        now_wall: DateTime<Utc>,
    ) -> bool {
        if !state.is_resumable(now_elapsed_ms) {
            return false;
        }

        self.window = AccumulatedWindow {
            start_elapsed_ms: state.window_start_elapsed_ms,
            start_uptime_ms: state.window_start_uptime_ms,
            started_wall: state.window_start_elapsed_ms.map(|start| {
                now_wall - Duration::milliseconds(now_elapsed_ms.saturating_sub(start) as i64)
            }),
            screen_on_accum_ms: state.screen_accumulator_ms,
            ..AccumulatedWindow::default()
        };
        true
    }

    fn close_window(
        &self,
        elapsed_ms: u64,
        wall: DateTime<Utc>,
        reason: WindowEndReason,
    ) -> ClosedWindow {
        let window_ms = self.window.window_ms(elapsed_ms);
        let screen_on_ms = self.window.screen_on_ms(elapsed_ms).min(window_ms);
        let started_at = self
            .window
            .started_wall
            .unwrap_or_else(|| wall - Duration::milliseconds(window_ms as i64));

        ClosedWindow {
            started_at,
            ended_at: wall,
            window_ms,
            screen_on_ms,
            consumed_on_uah: self.window.consumed_on_uah,
            consumed_off_uah: self.window.consumed_off_uah,
            drop_on_pct: self.window.drop_on_pct,
            drop_off_pct: self.window.drop_off_pct,
            reason,
        }
    }

    fn smooth_current(&mut self, battery: &BatterySnapshot, charging: bool) {
        let Some(raw) = battery.current_ua else {
            return;
        };
        // Raw polarity differs across fuel gauges; normalize so charging is
        // positive and discharging negative.
        let magnitude = raw.unsigned_abs() as f64;
        let signed = if charging { magnitude } else { -magnitude };
        self.smoothed_current_ua = Some(match self.smoothed_current_ua {
            Some(prev) => CURRENT_NEW_WEIGHT * signed + (1.0 - CURRENT_NEW_WEIGHT) * prev,
            None => signed,
        });
    }

    /// Prefer the gauge-reported integer level; coulomb-counter noise
    /// couples to instantaneous draw, so the derived percentage is a
    /// fallback only.
    fn level_pct(&self, battery: &BatterySnapshot) -> Option<f64> {
        if let Some(level) = battery.level_pct {
            return Some(level as f64);
        }
        match (battery.charge_counter_uah, self.design_capacity_uah) {
            (Some(charge), Some(capacity)) if capacity > 0 => {
                Some(charge as f64 * 100.0 / capacity as f64)
            }
            _ => None,
        }
    }

    fn learn_capacity(&mut self, battery: &BatterySnapshot) {
        if self.design_capacity_uah.is_some() {
            return;
        }
        if let (Some(charge), Some(level)) = (battery.charge_counter_uah, battery.level_pct) {
            self.design_capacity_uah = derive_capacity_uah(charge, level);
        }
    }

    fn derived(&self, sample: &Sample, level: Option<f64>, charging: bool) -> DerivedMetrics {
        let window_ms = self.window.window_ms(sample.elapsed_ms);
        let screen_on_ms = self.window.screen_on_ms(sample.elapsed_ms).min(window_ms);
        let screen_off_ms = window_ms - screen_on_ms;
        let awake_ms = self.window.awake_ms(sample.uptime_ms).min(window_ms);
        let deep_sleep_ms = window_ms - awake_ms;

        DerivedMetrics {
            level_pct: level,
            status: sample.battery.status,
            charging,
            interactive: sample.interactive,
            current_ma: self.smoothed_current_ua.map(|ua| ua / 1000.0),
            voltage_v: sample.battery.voltage_uv.map(|uv| uv as f64 / 1_000_000.0),
            temp_c: sample.battery.temp_deci_c.map(|deci| deci as f64 / 10.0),
            window_ms,
            screen_on_ms,
            screen_off_ms,
            awake_ms,
            deep_sleep_ms,
            consumed_on_mah: self.window.consumed_on_uah as f64 / 1000.0,
            consumed_off_mah: self.window.consumed_off_uah as f64 / 1000.0,
            drop_on_pct: self.window.drop_on_pct,
            drop_off_pct: self.window.drop_off_pct,
            active_rate_pct_per_hr: rate_pct_per_hr(self.window.drop_on_pct, screen_on_ms),
            idle_rate_pct_per_hr: rate_pct_per_hr(self.window.drop_off_pct, screen_off_ms),
        }
    }
}

/// Drain rate for a bucket. Zero time or zero drop reports exactly zero,
/// never NaN or a negative.
fn rate_pct_per_hr(drop_pct: f64, bucket_ms: u64) -> f64 {
    if bucket_ms == 0 || drop_pct <= 0.0 {
        return 0.0;
    }
    drop_pct * 3_600_000.0 / bucket_ms as f64
}

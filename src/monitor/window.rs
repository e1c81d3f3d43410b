use chrono::{DateTime, Utc};

/// Accounting state for one discharge window: last unplug (or explicit
/// reset) up to the next charge event.
///
/// Start markers and the open screen-on marker are tagged options, never
/// sentinel values. `screen_on_accum_ms` holds closed on-periods; the open
/// period, if any, combines with `screen_on_since_ms` to give the live total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedWindow {
    pub start_elapsed_ms: Option<u64>,
    pub start_uptime_ms: Option<u64>,
    pub started_wall: Option<DateTime<Utc>>,
    pub screen_on_accum_ms: u64,
    pub screen_on_since_ms: Option<u64>,
    pub consumed_on_uah: u64,
    pub consumed_off_uah: u64,
    pub drop_on_pct: f64,
    pub drop_off_pct: f64,
}

impl AccumulatedWindow {
    pub fn is_open(&self) -> bool {
        self.start_elapsed_ms.is_some()
    }

    /// Charging detected: accounting must not mix charge cycles, so
    /// everything clears and the start markers unset.
    pub fn reset_for_charging(&mut self) {
        *self = Self::default();
    }

    /// First non-charging sample after creation or after a charge ended.
    pub fn begin_discharge(
        &mut self,
        elapsed_ms: u64,
        uptime_ms: u64,
        wall: DateTime<Utc>,
        interactive: bool,
    ) {
        *self = Self {
            start_elapsed_ms: Some(elapsed_ms),
            start_uptime_ms: Some(uptime_ms),
            started_wall: Some(wall),
            screen_on_since_ms: interactive.then_some(elapsed_ms),
            ..Self::default()
        };
    }

    /// Screen turned on: open an on-period unless one is already open.
    pub fn note_screen_on(&mut self, now_elapsed_ms: u64) {
        if self.screen_on_since_ms.is_none() {
            self.screen_on_since_ms = Some(now_elapsed_ms);
        }
    }

    /// Screen turned off: fold the open on-period into the accumulator.
    pub fn fold_screen_off(&mut self, now_elapsed_ms: u64) {
        if let Some(since) = self.screen_on_since_ms.take() {
            self.screen_on_accum_ms += now_elapsed_ms.saturating_sub(since);
        }
    }

    /// Closed on-periods plus the currently open one.
    pub fn screen_on_ms(&self, now_elapsed_ms: u64) -> u64 {
        let open = self
            .screen_on_since_ms
            .map(|since| now_elapsed_ms.saturating_sub(since))
            .unwrap_or(0);
        self.screen_on_accum_ms + open
    }

    pub fn window_ms(&self, now_elapsed_ms: u64) -> u64 {
        self.start_elapsed_ms
            .map(|start| now_elapsed_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    /// Time spent out of deep sleep since the window started.
    pub fn awake_ms(&self, now_uptime_ms: u64) -> u64 {
        self.start_uptime_ms
            .map(|start| now_uptime_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    pub fn add_consumed(&mut self, interactive: bool, delta_uah: u64) {
        if interactive {
            self.consumed_on_uah += delta_uah;
        } else {
            self.consumed_off_uah += delta_uah;
        }
    }

    pub fn add_drop(&mut self, interactive: bool, delta_pct: f64) {
        if interactive {
            self.drop_on_pct += delta_pct;
        } else {
            self.drop_off_pct += delta_pct;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn wall(ms: u64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms as i64).unwrap()
    }

    #[test]
    fn begin_discharge_opens_window_with_interactive_marker() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(10_000, 8_000, wall(10_000), true);

        assert!(window.is_open());
        assert_eq!(window.screen_on_since_ms, Some(10_000));
        assert_eq!(window.screen_on_ms(25_000), 15_000);
        assert_eq!(window.window_ms(25_000), 15_000);
    }

    #[test]
    fn screen_off_folds_open_period_once() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(0, 0, wall(0), true);

        window.fold_screen_off(30_000);
        assert_eq!(window.screen_on_accum_ms, 30_000);
        assert_eq!(window.screen_on_since_ms, None);

        // A second fold without a reopened period is a no-op.
        window.fold_screen_off(60_000);
        assert_eq!(window.screen_on_accum_ms, 30_000);

        window.note_screen_on(60_000);
        assert_eq!(window.screen_on_ms(90_000), 60_000);
    }

    #[test]
    fn note_screen_on_does_not_restart_open_period() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(0, 0, wall(0), true);

        window.note_screen_on(40_000);
        assert_eq!(window.screen_on_since_ms, Some(0));
    }

    #[test]
    fn accumulators_split_by_bucket_and_never_decrease() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(0, 0, wall(0), true);

        window.add_consumed(true, 1_000);
        window.add_consumed(false, 250);
        window.add_drop(true, 0.5);
        window.add_drop(false, 0.1);
        window.add_consumed(true, 500);

        assert_eq!(window.consumed_on_uah, 1_500);
        assert_eq!(window.consumed_off_uah, 250);
        assert!((window.drop_on_pct - 0.5).abs() < f64::EPSILON);
        assert!((window.drop_off_pct - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_for_charging_clears_everything() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(5_000, 5_000, wall(5_000), true);
        window.add_consumed(true, 2_000);
        window.add_drop(false, 1.25);

        window.reset_for_charging();
        assert_eq!(window, AccumulatedWindow::default());
        assert!(!window.is_open());
    }

    #[test]
    fn awake_tracks_uptime_clock() {
        let mut window = AccumulatedWindow::default();
        window.begin_discharge(0, 0, wall(0), false);

        // 100s of window time, 40s of it asleep.
        assert_eq!(window.window_ms(100_000), 100_000);
        assert_eq!(window.awake_ms(60_000), 60_000);
    }
}

use anyhow::{Context, Result};
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::events::MonitorEvent;

use super::loop_worker::{monitor_loop, MonitorContext};

/// Owns the monitoring task: idempotent start, reset injection, and a
/// teardown that joins the loop so the final state flush has happened by the
/// time `stop` returns.
pub struct MonitorController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    event_tx: mpsc::Sender<MonitorEvent>,
}

impl MonitorController {
    pub fn new(event_tx: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            handle: None,
            cancel_token: None,
            event_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the monitoring loop. A second start while running is a no-op.
    pub fn start(
        &mut self,
        ctx: MonitorContext,
        event_rx: mpsc::Receiver<MonitorEvent>,
        interval: Duration,
    ) {
        if self.handle.is_some() {
            info!("monitor already running; ignoring start");
            return;
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            ctx,
            event_rx,
            interval,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
    }

    /// Clear all accumulators and restart the window now. Works whether the
    /// battery is charging or not.
    pub async fn reset(&self) -> Result<()> {
        self.event_tx
            .send(MonitorEvent::Reset)
            .await
            .context("monitor loop is not receiving events")
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("monitor loop task failed to join")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::db::Database;
    use crate::metrics::MetricsCollector;
    use crate::monitor::SampleEngine;
    use crate::persist::AccountingStore;
    use crate::status::{StatusPayload, StatusSink};
    use crate::telemetry::testing::ScriptedBattery;
    use crate::telemetry::{BatterySnapshot, ChargeStatus};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct NullSink;

    impl StatusSink for NullSink {
        fn publish(&mut self, _payload: &StatusPayload) -> Result<()> {
            Ok(())
        }
    }

    fn context(dir: &tempfile::TempDir) -> MonitorContext {
        MonitorContext {
            engine: Arc::new(Mutex::new(SampleEngine::new(None))),
            telemetry: Box::new(ScriptedBattery::new(
                vec![BatterySnapshot {
                    level_pct: Some(75),
                    status: ChargeStatus::Discharging,
                    ..BatterySnapshot::default()
                }],
                None,
            )),
            clock: Arc::new(ManualClock::at(10_000, 10_000)),
            interactive: Arc::new(AtomicBool::new(true)),
            store: Arc::new(AccountingStore::new(dir.path().join("accounting.json")).unwrap()),
            db: Database::new(dir.path().join("archive.sqlite3")).unwrap(),
            sink: Box::new(NullSink),
            metrics: MetricsCollector::new(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let dir = tempfile::tempdir().unwrap();
        let (event_tx, event_rx) = mpsc::channel(4);

        let mut controller = MonitorController::new(event_tx);
        assert!(!controller.is_running());

        controller.start(context(&dir), event_rx, Duration::from_millis(20));
        assert!(controller.is_running());

        // Second start while running must not replace the loop.
        let (_tx2, rx2) = mpsc::channel(4);
        controller.start(context(&dir), rx2, Duration::from_millis(20));
        assert!(controller.is_running());

        controller.stop().await.unwrap();
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn reset_fails_after_loop_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let (event_tx, event_rx) = mpsc::channel(4);

        let mut controller = MonitorController::new(event_tx);
        controller.start(context(&dir), event_rx, Duration::from_millis(20));
        controller.reset().await.unwrap();

        controller.stop().await.unwrap();
        assert!(controller.reset().await.is_err());
    }
}

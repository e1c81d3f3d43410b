use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::db::models::DischargeWindow;
use crate::db::Database;
use crate::events::MonitorEvent;
use crate::metrics::{MetricsCollector, TickMetrics};
use crate::persist::AccountingStore;
use crate::status::{build_payload, format_duration_ms, StatusSink};
use crate::telemetry::TelemetrySource;

use super::engine::{ClosedWindow, Sample, SampleEngine};

const METRICS_DIGEST_EVERY_TICKS: u64 = 60;

/// Everything the monitoring loop touches. The engine sits behind a mutex so
/// the loop and the event path never race on accumulator state.
pub struct MonitorContext {
    pub engine: Arc<Mutex<SampleEngine>>,
    pub telemetry: Box<dyn TelemetrySource>,
    pub clock: Arc<dyn Clock>,
    pub interactive: Arc<AtomicBool>,
    pub store: Arc<AccountingStore>,
    pub db: Database,
    pub sink: Box<dyn StatusSink>,
    pub metrics: MetricsCollector,
}

/// Sample → persist → publish, then wait out the interval. An incoming event
/// short-circuits the wait, mutates the engine, and forces an immediate extra
/// sample; the wait after that sample is the full interval again.
pub async fn monitor_loop(
    mut ctx: MonitorContext,
    mut event_rx: mpsc::Receiver<MonitorEvent>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!("monitor loop started (interval {}ms)", interval.as_millis());

    let mut ticks: u64 = 0;
    let mut event_driven = false;
    let mut events_closed = false;

    loop {
        if let Err(err) = run_tick(&mut ctx, event_driven).await {
            error!("sample tick failed: {err:?}");
        }
        event_driven = false;

        ticks = ticks.wrapping_add(1);
        if ticks % METRICS_DIGEST_EVERY_TICKS == 0 {
            let snapshot = ctx.metrics.snapshot().await;
            info!(
                "{} samples ({} event-driven) · cpu {:.1}% · rss {:.1} MB",
                snapshot.sample_count,
                snapshot.event_refresh_count,
                snapshot.system.cpu_percent,
                snapshot.system.memory_mb
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            maybe_event = event_rx.recv(), if !events_closed => {
                match maybe_event {
                    Some(event) => {
                        handle_event(&mut ctx, event).await;
                        event_driven = true;
                    }
                    None => {
                        debug!("event channel closed; continuing on cadence only");
                        events_closed = true;
                    }
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    // Flush synchronously so a restart can resume the in-progress window.
    let now_elapsed = ctx.clock.elapsed_realtime_ms();
    let state = ctx.engine.lock().await.persisted_state(now_elapsed);
    if let Err(err) = ctx.store.save(state) {
        error!("failed to flush accounting state on shutdown: {err:?}");
    }
    info!("monitor loop shutting down");
}

async fn run_tick(ctx: &mut MonitorContext, event_driven: bool) -> Result<()> {
    let telemetry_start = Instant::now();
    let battery = ctx.telemetry.snapshot();
    let telemetry_ms = telemetry_start.elapsed().as_millis() as u64;

    let sample = Sample {
        elapsed_ms: ctx.clock.elapsed_realtime_ms(),
        uptime_ms: ctx.clock.uptime_ms(),
        wall: ctx.clock.wall(),
        battery,
        interactive: ctx.interactive.load(Ordering::Relaxed),
    };

    let (outcome, persisted) = {
        let mut engine = ctx.engine.lock().await;
        let outcome = engine.apply(&sample);
        (outcome, engine.persisted_state(sample.elapsed_ms))
    };

    if let Some(closed) = &outcome.closed_window {
        archive_window(&ctx.db, closed).await;
    }

    let persist_start = Instant::now();
    ctx.store
        .save(persisted)
        .context("failed to persist accounting state")?;
    let persist_ms = persist_start.elapsed().as_millis() as u64;

    let publish_start = Instant::now();
    let payload = build_payload(&outcome.metrics);
    ctx.sink
        .publish(&payload)
        .context("failed to publish status")?;
    let publish_ms = publish_start.elapsed().as_millis() as u64;

    ctx.metrics
        .record_tick(TickMetrics {
            at: sample.wall,
            telemetry_ms,
            persist_ms,
            publish_ms,
            event_driven,
        })
        .await;

    debug!(
        "tick: level {:?} window {}ms screen-on {}ms (telemetry {}ms persist {}ms publish {}ms)",
        outcome.metrics.level_pct,
        outcome.metrics.window_ms,
        outcome.metrics.screen_on_ms,
        telemetry_ms,
        persist_ms,
        publish_ms
    );

    Ok(())
}

async fn handle_event(ctx: &mut MonitorContext, event: MonitorEvent) {
    let now_elapsed = ctx.clock.elapsed_realtime_ms();

    match event {
        MonitorEvent::ScreenOn | MonitorEvent::UserPresent => {
            ctx.engine.lock().await.handle_screen_on(now_elapsed);
        }
        MonitorEvent::ScreenOff => {
            ctx.engine.lock().await.handle_screen_off(now_elapsed);
        }
        // The window transition itself happens in the immediate sample that
        // follows; the event only collapses the wait.
        MonitorEvent::PowerConnected | MonitorEvent::PowerDisconnected => {}
        MonitorEvent::Reset => {
            let closed = {
                let mut engine = ctx.engine.lock().await;
                engine.reset(
                    now_elapsed,
                    ctx.clock.uptime_ms(),
                    ctx.clock.wall(),
                    ctx.interactive.load(Ordering::Relaxed),
                )
            };
            if let Some(closed) = closed {
                archive_window(&ctx.db, &closed).await;
            }
        }
    }

    debug!("immediate refresh on {event:?}");
}

async fn archive_window(db: &Database, closed: &ClosedWindow) {
    let record = DischargeWindow::from_closed(closed);
    match db.insert_window(&record).await {
        Ok(()) => info!(
            "archived discharge window {} ({}, {:.2}% on / {:.2}% off)",
            record.id,
            format_duration_ms(record.window_ms),
            record.drop_on_pct,
            record.drop_off_pct
        ),
        Err(err) => error!("failed to archive discharge window: {err:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::monitor::WindowEndReason;
    use crate::status::StatusPayload;
    use crate::telemetry::testing::ScriptedBattery;
    use crate::telemetry::{BatterySnapshot, ChargeStatus};

    #[derive(Clone, Default)]
    struct CapturingSink {
        payloads: Arc<std::sync::Mutex<Vec<StatusPayload>>>,
    }

    impl StatusSink for CapturingSink {
        fn publish(&mut self, payload: &StatusPayload) -> Result<()> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn discharging_snapshot(level: i64) -> BatterySnapshot {
        BatterySnapshot {
            level_pct: Some(level),
            status: ChargeStatus::Discharging,
            charge_counter_uah: Some(level * 40_000),
            ..BatterySnapshot::default()
        }
    }

    struct Harness {
        engine: Arc<Mutex<SampleEngine>>,
        store: Arc<AccountingStore>,
        db: Database,
        clock: ManualClock,
        sink: CapturingSink,
        event_tx: mpsc::Sender<MonitorEvent>,
        cancel_token: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn spawn_harness(snapshots: Vec<BatterySnapshot>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Mutex::new(SampleEngine::new(None)));
        let store = Arc::new(AccountingStore::new(dir.path().join("accounting.json")).unwrap());
        let db = Database::new(dir.path().join("archive.sqlite3")).unwrap();
        let clock = ManualClock::at(100_000, 100_000);
        let sink = CapturingSink::default();
        let (event_tx, event_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();

        let ctx = MonitorContext {
            engine: Arc::clone(&engine),
            telemetry: Box::new(ScriptedBattery::new(snapshots, None)),
            clock: Arc::new(clock.clone()),
            interactive: Arc::new(AtomicBool::new(true)),
            store: Arc::clone(&store),
            db: db.clone(),
            sink: Box::new(sink.clone()),
            metrics: MetricsCollector::new(),
        };

        let handle = tokio::spawn(monitor_loop(
            ctx,
            event_rx,
            Duration::from_millis(20),
            cancel_token.clone(),
        ));

        Harness {
            engine,
            store,
            db,
            clock,
            sink,
            event_tx,
            cancel_token,
            handle,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn samples_publish_and_persist_until_cancelled() {
        let harness = spawn_harness(vec![discharging_snapshot(90)]);

        tokio::time::sleep(Duration::from_millis(90)).await;
        harness.cancel_token.cancel();
        harness.handle.await.unwrap();

        assert!(harness.sink.payloads.lock().unwrap().len() >= 2);

        let persisted = harness.store.load();
        assert_eq!(persisted.last_persisted_elapsed_ms, 100_000);
        assert_eq!(persisted.window_start_elapsed_ms, Some(100_000));
        assert!(harness.engine.lock().await.window().is_open());
    }

    #[tokio::test]
    async fn reset_event_archives_live_window() {
        let harness = spawn_harness(vec![discharging_snapshot(90)]);

        // Let the window open and accrue a little time.
        tokio::time::sleep(Duration::from_millis(40)).await;
        harness.clock.advance(30_000);

        harness.event_tx.send(MonitorEvent::Reset).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        harness.cancel_token.cancel();
        harness.handle.await.unwrap();

        let windows = harness.db.list_recent_windows(10).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].end_reason, WindowEndReason::Reset);
        assert_eq!(windows[0].window_ms, 30_000);

        // Accounting restarted at the reset point.
        let window = harness.engine.lock().await.window().clone();
        assert_eq!(window.start_elapsed_ms, Some(130_000));
    }

    #[tokio::test]
    async fn screen_off_event_folds_open_period() {
        let harness = spawn_harness(vec![discharging_snapshot(90)]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        harness.clock.advance(60_000);

        harness.event_tx.send(MonitorEvent::ScreenOff).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        harness.cancel_token.cancel();
        harness.handle.await.unwrap();

        let window = harness.engine.lock().await.window().clone();
        assert_eq!(window.screen_on_accum_ms, 60_000);
    }
}

pub mod clock;
pub mod db;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod persist;
pub mod status;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

use clock::{Clock, SystemClock};
use db::Database;
use events::EventWatcher;
use metrics::MetricsCollector;
use monitor::{MonitorContext, MonitorController, Sample, SampleEngine};
use persist::AccountingStore;
use status::FileStatusSink;
use telemetry::{SysfsBattery, TelemetrySource};

pub struct RunOptions {
    pub data_dir: PathBuf,
    pub battery: Option<String>,
    pub interval_ms: u64,
    pub status_path: Option<PathBuf>,
}

pub async fn run(opts: RunOptions) -> Result<()> {
    std::fs::create_dir_all(&opts.data_dir)
        .with_context(|| format!("failed to create data dir {}", opts.data_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(AccountingStore::new(opts.data_dir.join("accounting.json"))?);
    let database = Database::new(opts.data_dir.join("drainwatch.sqlite3"))?;

    let mut telemetry = SysfsBattery::discover(opts.battery.as_deref())?;
    let capacity = telemetry.design_capacity_uah();
    if let Some(capacity) = capacity {
        info!("design capacity {:.0} mAh", capacity as f64 / 1000.0);
    }

    // Resume the accounting window that was in progress when the process
    // last died, unless the machine rebooted in between.
    let mut engine = SampleEngine::new(capacity);
    let stored = store.load();
    let now_elapsed = clock.elapsed_realtime_ms();
    if engine.restore(&stored, now_elapsed, clock.wall()) {
        info!(
            "resumed accounting window (screen-on {})",
            status::format_duration_ms(stored.screen_accumulator_ms)
        );
    } else if stored.last_persisted_elapsed_ms != 0 {
        warn!("discarding stale accounting state (reboot detected)");
    }

    let (event_tx, event_rx) = mpsc::channel(16);
    let mut watcher = EventWatcher::start(event_tx.clone());

    let status_path = opts
        .status_path
        .unwrap_or_else(|| opts.data_dir.join("status.txt"));

    let ctx = MonitorContext {
        engine: Arc::new(Mutex::new(engine)),
        telemetry: Box::new(telemetry),
        clock: Arc::clone(&clock),
        interactive: watcher.interactive_flag(),
        store: Arc::clone(&store),
        db: database.clone(),
        sink: Box::new(FileStatusSink::new(status_path)),
        metrics: MetricsCollector::new(),
    };

    let mut controller = MonitorController::new(event_tx);
    controller.start(ctx, event_rx, Duration::from_millis(opts.interval_ms));

    wait_for_shutdown(&controller).await?;

    watcher.stop().await;
    controller.stop().await?;
    info!("drainwatch stopped");
    Ok(())
}

/// Take a single sample and print the status payload to stdout. Leaves the
/// persisted accounting state untouched.
pub fn run_once(opts: RunOptions) -> Result<()> {
    let clock = SystemClock;
    let mut telemetry = SysfsBattery::discover(opts.battery.as_deref())?;
    let capacity = telemetry.design_capacity_uah();
    let mut engine = SampleEngine::new(capacity);

    let sample = Sample {
        elapsed_ms: clock.elapsed_realtime_ms(),
        uptime_ms: clock.uptime_ms(),
        wall: clock.wall(),
        battery: telemetry.snapshot(),
        interactive: events::ScreenProbe::detect()
            .map(|probe| probe.is_on())
            .unwrap_or(true),
    };

    let outcome = engine.apply(&sample);
    let payload = status::build_payload(&outcome.metrics);
    println!("{}", payload.title);
    println!("{}", payload.body);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(controller: &MonitorController) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received; resetting accounting window");
                if let Err(err) = controller.reset().await {
                    warn!("reset failed: {err:?}");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_controller: &MonitorController) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}

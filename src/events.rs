use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::telemetry::{sysfs, POWER_SUPPLY_ROOT};

/// Out-of-band triggers that force an immediate sample ahead of the cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    ScreenOn,
    ScreenOff,
    /// No sysfs analogue on Linux; injectable by tests or a future control
    /// surface. Handled like a screen-on refresh.
    UserPresent,
    PowerConnected,
    PowerDisconnected,
    /// Clears all accumulators and restarts the window, independent of
    /// charge state. The daemon maps SIGUSR1 to this.
    Reset,
}

const PROBE_POLL_MS: u64 = 1000;

const BACKLIGHT_ROOT: &str = "/sys/class/backlight";

/// Answers "is the display lit right now". A missing probe reads as ON so a
/// headless or unusual machine attributes everything to the active bucket
/// rather than silently inventing idle time.
pub struct ScreenProbe {
    node: PathBuf,
}

impl ScreenProbe {
    pub fn detect() -> Option<Self> {
        Self::detect_in(Path::new(BACKLIGHT_ROOT))
    }

    pub fn detect_in(root: &Path) -> Option<Self> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        dirs.sort();

        for dir in dirs {
            for node in ["actual_brightness", "brightness"] {
                let path = dir.join(node);
                if sysfs::read_i64(&path).is_some() {
                    return Some(Self { node: path });
                }
            }
        }
        None
    }

    pub fn is_on(&self) -> bool {
        match sysfs::read_i64(&self.node) {
            Some(value) => value > 0,
            None => true,
        }
    }
}

/// Answers "is any external supply online".
pub struct ChargeProbe {
    online_nodes: Vec<PathBuf>,
}

impl ChargeProbe {
    pub fn detect() -> Option<Self> {
        Self::detect_in(Path::new(POWER_SUPPLY_ROOT))
    }

    pub fn detect_in(root: &Path) -> Option<Self> {
        let mut online_nodes: Vec<PathBuf> = fs::read_dir(root)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("online"))
            .filter(|node| node.exists())
            .collect();
        online_nodes.sort();

        if online_nodes.is_empty() {
            None
        } else {
            Some(Self { online_nodes })
        }
    }

    pub fn is_plugged(&self) -> bool {
        self.online_nodes
            .iter()
            .any(|node| sysfs::read_i64(node).unwrap_or(0) != 0)
    }
}

/// Polls the screen and charge probes and turns level changes into
/// `MonitorEvent` edges for the monitor loop. Also publishes the live
/// interactive flag the sampling path reads directly.
pub struct EventWatcher {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    interactive: Arc<AtomicBool>,
}

impl EventWatcher {
    pub fn start(event_tx: mpsc::Sender<MonitorEvent>) -> Self {
        let screen_probe = ScreenProbe::detect();
        if screen_probe.is_none() {
            info!("screen probe not found (assume interactive)");
        }
        let charge_probe = ChargeProbe::detect();
        if charge_probe.is_none() {
            info!("charge probe not found (power events disabled)");
        }

        let interactive = Arc::new(AtomicBool::new(
            screen_probe.as_ref().map(|probe| probe.is_on()).unwrap_or(true),
        ));

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(probe_loop(
            screen_probe,
            charge_probe,
            Arc::clone(&interactive),
            event_tx,
            cancel_token.clone(),
        ));

        Self {
            handle: Some(handle),
            cancel_token: Some(cancel_token),
            interactive,
        }
    }

    /// Shared flag the sampling loop reads for the current interactivity.
    pub fn interactive_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interactive)
    }

    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!("event watcher task failed to join: {err}");
            }
        }
    }
}

async fn probe_loop(
    screen_probe: Option<ScreenProbe>,
    charge_probe: Option<ChargeProbe>,
    interactive: Arc<AtomicBool>,
    event_tx: mpsc::Sender<MonitorEvent>,
    cancel_token: CancellationToken,
) {
    let mut last_screen_on = interactive.load(Ordering::Relaxed);
    let mut last_plugged = charge_probe.as_ref().map(|probe| probe.is_plugged());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(PROBE_POLL_MS)) => {}
            _ = cancel_token.cancelled() => {
                info!("event watcher shutting down");
                break;
            }
        }

        if let Some(probe) = &screen_probe {
            let screen_on = probe.is_on();
            if screen_on != last_screen_on {
                last_screen_on = screen_on;
                interactive.store(screen_on, Ordering::Relaxed);
                let event = if screen_on {
                    MonitorEvent::ScreenOn
                } else {
                    MonitorEvent::ScreenOff
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        if let Some(probe) = &charge_probe {
            let plugged = probe.is_plugged();
            if last_plugged != Some(plugged) {
                last_plugged = Some(plugged);
                let event = if plugged {
                    MonitorEvent::PowerConnected
                } else {
                    MonitorEvent::PowerDisconnected
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

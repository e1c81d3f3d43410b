mod capacity;
pub(crate) mod sysfs;

pub use capacity::{derive_capacity_uah, design_capacity_uah, normalize_capacity_uah};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};

pub const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Charging,
    Discharging,
    NotCharging,
    Full,
    Unknown,
}

impl Default for ChargeStatus {
    fn default() -> Self {
        ChargeStatus::Unknown
    }
}

impl ChargeStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Charging" => ChargeStatus::Charging,
            "Discharging" => ChargeStatus::Discharging,
            "Not charging" => ChargeStatus::NotCharging,
            "Full" => ChargeStatus::Full,
            _ => ChargeStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Charging => "Charging",
            ChargeStatus::Discharging => "Discharging",
            ChargeStatus::NotCharging => "Not charging",
            ChargeStatus::Full => "Full",
            ChargeStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugSource {
    Mains,
    Usb,
    Wireless,
}

impl PlugSource {
    fn from_supply_type(raw: &str) -> Option<Self> {
        match raw {
            "Mains" => Some(PlugSource::Mains),
            "USB" => Some(PlugSource::Usb),
            "Wireless" => Some(PlugSource::Wireless),
            _ => None,
        }
    }
}

/// Point-in-time battery telemetry. Every field a read can fail for is
/// optional; a failed read degrades to `None` rather than aborting a sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatterySnapshot {
    pub level_pct: Option<i64>,
    pub status: ChargeStatus,
    pub plugged: Option<PlugSource>,
    pub temp_deci_c: Option<i64>,
    pub current_ua: Option<i64>,
    pub voltage_uv: Option<i64>,
    pub charge_counter_uah: Option<i64>,
}

impl BatterySnapshot {
    /// The window-reset condition: an explicit charging status or any
    /// external supply online.
    pub fn is_charging(&self) -> bool {
        matches!(self.status, ChargeStatus::Charging | ChargeStatus::Full) || self.plugged.is_some()
    }
}

pub trait TelemetrySource: Send {
    fn snapshot(&mut self) -> BatterySnapshot;

    /// Design capacity in µAh, if the platform exposes one.
    fn design_capacity_uah(&mut self) -> Option<i64>;
}

/// Battery telemetry read from `/sys/class/power_supply`.
pub struct SysfsBattery {
    battery_dir: PathBuf,
    plug_nodes: Vec<(PlugSource, PathBuf)>,
    current_candidates: Vec<PathBuf>,
    voltage_candidates: Vec<PathBuf>,
    charge_candidates: Vec<PathBuf>,
}

impl SysfsBattery {
    pub fn discover(name_override: Option<&str>) -> Result<Self> {
        Self::discover_in(Path::new(POWER_SUPPLY_ROOT), name_override)
    }

    pub fn discover_in(root: &Path, name_override: Option<&str>) -> Result<Self> {
        let mut battery_dir = None;
        let mut plug_nodes = Vec::new();

        let entries = fs::read_dir(root)
            .with_context(|| format!("failed to enumerate {}", root.display()))?;

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let supply_type = sysfs::read_trimmed(&dir.join("type")).unwrap_or_default();

            if supply_type == "Battery" {
                match name_override {
                    Some(wanted) if wanted != name => continue,
                    _ => {}
                }
                if battery_dir.is_none() {
                    battery_dir = Some(dir.clone());
                }
            } else if let Some(source) = PlugSource::from_supply_type(&supply_type) {
                let online = dir.join("online");
                if online.exists() {
                    plug_nodes.push((source, online));
                }
            }
        }

        let Some(battery_dir) = battery_dir else {
            match name_override {
                Some(wanted) => bail!(
                    "battery supply '{}' not found under {}",
                    wanted,
                    root.display()
                ),
                None => bail!("no battery supply found under {}", root.display()),
            }
        };

        info!(
            "battery telemetry at {} ({} plug probe{})",
            battery_dir.display(),
            plug_nodes.len(),
            if plug_nodes.len() == 1 { "" } else { "s" }
        );

        Ok(Self {
            current_candidates: vec![
                battery_dir.join("current_now"),
                battery_dir.join("current_avg"),
            ],
            voltage_candidates: vec![
                battery_dir.join("voltage_now"),
                battery_dir.join("voltage_avg"),
            ],
            charge_candidates: vec![
                battery_dir.join("charge_counter"),
                battery_dir.join("charge_now"),
            ],
            battery_dir,
            plug_nodes,
        })
    }

    fn read_plugged(&self) -> Option<PlugSource> {
        self.plug_nodes
            .iter()
            .find(|(_, path)| sysfs::read_i64(path).unwrap_or(0) != 0)
            .map(|(source, _)| *source)
    }
}

impl TelemetrySource for SysfsBattery {
    fn snapshot(&mut self) -> BatterySnapshot {
        let status = sysfs::read_trimmed(&self.battery_dir.join("status"))
            .map(|raw| ChargeStatus::parse(&raw))
            .unwrap_or_default();

        BatterySnapshot {
            level_pct: sysfs::read_i64(&self.battery_dir.join("capacity")),
            status,
            plugged: self.read_plugged(),
            temp_deci_c: sysfs::read_i64(&self.battery_dir.join("temp")),
            current_ua: sysfs::first_i64(&self.current_candidates),
            voltage_uv: sysfs::first_i64(&self.voltage_candidates),
            charge_counter_uah: sysfs::first_i64(&self.charge_candidates),
        }
    }

    fn design_capacity_uah(&mut self) -> Option<i64> {
        let capacity = design_capacity_uah(&self.battery_dir);
        if capacity.is_none() {
            warn!(
                "no capacity node under {}; will derive from charge counter",
                self.battery_dir.display()
            );
        }
        capacity
    }
}

#[cfg(test)]
pub mod testing {
    use super::{BatterySnapshot, TelemetrySource};
    use std::collections::VecDeque;

    /// Scripted telemetry for tests: pops snapshots in order, then repeats
    /// the last one.
    pub struct ScriptedBattery {
        snapshots: VecDeque<BatterySnapshot>,
        last: BatterySnapshot,
        capacity_uah: Option<i64>,
    }

    impl ScriptedBattery {
        pub fn new(snapshots: Vec<BatterySnapshot>, capacity_uah: Option<i64>) -> Self {
            Self {
                snapshots: snapshots.into(),
                last: BatterySnapshot::default(),
                capacity_uah,
            }
        }
    }

    impl TelemetrySource for ScriptedBattery {
        fn snapshot(&mut self) -> BatterySnapshot {
            if let Some(next) = self.snapshots.pop_front() {
                self.last = next;
            }
            self.last
        }

        fn design_capacity_uah(&mut self) -> Option<i64> {
            self.capacity_uah
        }
    }
}

use std::path::Path;

use super::sysfs;

/// Capacity nodes in preference order. `energy_*` nodes report µWh rather
/// than µAh; the magnitude heuristic still lands them in a usable range for
/// percentage derivation, which is all the capacity feeds.
const CAPACITY_NODES: &[&str] = &["charge_full_design", "charge_full", "energy_full_design"];

/// Read the battery's design capacity in µAh from the first readable node.
pub fn design_capacity_uah(battery_dir: &Path) -> Option<i64> {
    CAPACITY_NODES
        .iter()
        .filter_map(|node| sysfs::read_i64(&battery_dir.join(node)))
        .find(|raw| *raw > 0)
        .map(normalize_capacity_uah)
}

/// Kernels disagree on the unit of capacity nodes. Guess from magnitude:
/// a phone- or laptop-sized battery is a few thousand mAh, a few million µAh,
/// a few billion nAh.
pub fn normalize_capacity_uah(raw: i64) -> i64 {
    if raw >= 1_000_000_000 {
        raw / 1000
    } else if raw < 100_000 {
        raw * 1000
    } else {
        raw
    }
}

/// Fallback when no capacity node exists: infer total capacity from the
/// coulomb counter and the reported level.
pub fn derive_capacity_uah(charge_counter_uah: i64, level_pct: i64) -> Option<i64> {
    if charge_counter_uah <= 0 || level_pct <= 0 {
        return None;
    }
    Some(charge_counter_uah * 100 / level_pct)
}

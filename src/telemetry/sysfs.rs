use std::fs;
use std::path::{Path, PathBuf};

/// Read a sysfs node as a trimmed string. Any I/O failure reads as absent.
pub fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn read_i64(path: &Path) -> Option<i64> {
    read_trimmed(path)?.parse().ok()
}

/// Try candidate nodes in order; first readable integer wins.
pub fn first_i64(candidates: &[PathBuf]) -> Option<i64> {
    candidates.iter().find_map(|path| read_i64(path))
}

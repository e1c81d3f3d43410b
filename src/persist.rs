use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The slice of accounting state that must survive process death. Written on
/// every sample and on teardown, read back once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PersistedAccountingState {
    pub screen_accumulator_ms: u64,
    pub last_persisted_elapsed_ms: u64,
    pub window_start_elapsed_ms: Option<u64>,
    pub window_start_uptime_ms: Option<u64>,
}

impl PersistedAccountingState {
    /// A stored window is only worth resuming if it was actually written and
    /// elapsed-realtime has not gone backwards since. A smaller current value
    /// means a reboot (or a wraparound, which is indistinguishable); both
    /// invalidate.
    pub fn is_resumable(&self, now_elapsed_ms: u64) -> bool {
        self.last_persisted_elapsed_ms != 0 && self.last_persisted_elapsed_ms <= now_elapsed_ms
    }
}

/// Durable home of `PersistedAccountingState`: a small JSON file under the
/// data directory. Corruption or absence falls back to a fresh state rather
/// than surfacing an error.
pub struct AccountingStore {
    path: PathBuf,
    data: RwLock<PersistedAccountingState>,
}

impl AccountingStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path).with_context(|| {
                format!("failed to read accounting state from {}", path.display())
            })?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            PersistedAccountingState::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn load(&self) -> PersistedAccountingState {
        self.data.read().unwrap().clone()
    }

    pub fn save(&self, state: PersistedAccountingState) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        *guard = state;
        self.persist(&guard)
    }

    pub fn clear(&self) -> Result<()> {
        self.save(PersistedAccountingState::default())
    }

    fn persist(&self, data: &PersistedAccountingState) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write accounting state to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounting.json");

        let state = PersistedAccountingState {
            screen_accumulator_ms: 123_000,
            last_persisted_elapsed_ms: 456_000,
            window_start_elapsed_ms: Some(100_000),
            window_start_uptime_ms: Some(90_000),
        };

        let store = AccountingStore::new(path.clone()).unwrap();
        store.save(state.clone()).unwrap();

        let reopened = AccountingStore::new(path).unwrap();
        assert_eq!(reopened.load(), state);
    }

    #[test]
    fn keys_are_kebab_case() {
        let state = PersistedAccountingState {
            screen_accumulator_ms: 1,
            last_persisted_elapsed_ms: 2,
            window_start_elapsed_ms: Some(3),
            window_start_uptime_ms: None,
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"screen-accumulator-ms\""));
        assert!(json.contains("\"last-persisted-elapsed-ms\""));
        assert!(json.contains("\"window-start-elapsed-ms\""));
        assert!(json.contains("\"window-start-uptime-ms\""));
    }

    #[test]
    fn corrupt_file_falls_back_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounting.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = AccountingStore::new(path).unwrap();
        assert_eq!(store.load(), PersistedAccountingState::default());
    }

    #[test]
    fn resumable_requires_written_state_and_forward_clock() {
        let mut state = PersistedAccountingState::default();
        assert!(!state.is_resumable(10_000));

        state.last_persisted_elapsed_ms = 5_000;
        assert!(state.is_resumable(10_000));
        assert!(state.is_resumable(5_000));
        // Clock went backwards: reboot (or wraparound), either way stale.
        assert!(!state.is_resumable(4_999));
    }

    #[test]
    fn clear_resets_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounting.json");

        let store = AccountingStore::new(path.clone()).unwrap();
        store
            .save(PersistedAccountingState {
                screen_accumulator_ms: 50,
                last_persisted_elapsed_ms: 60,
                window_start_elapsed_ms: None,
                window_start_uptime_ms: None,
            })
            .unwrap();
        store.clear().unwrap();

        let reopened = AccountingStore::new(path).unwrap();
        assert_eq!(reopened.load(), PersistedAccountingState::default());
    }
}

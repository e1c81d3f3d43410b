use chrono::{DateTime, Utc};

/// Millisecond clock pair the accounting engine runs on.
///
/// `elapsed_realtime_ms` keeps counting through suspend; `uptime_ms` does not.
/// The difference between the two is time the machine spent in deep sleep.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds including suspend (CLOCK_BOOTTIME).
    fn elapsed_realtime_ms(&self) -> u64;

    /// Monotonic milliseconds excluding suspend (CLOCK_MONOTONIC).
    fn uptime_ms(&self) -> u64;

    /// Wall-clock timestamp for archival records.
    fn wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[cfg(target_os = "linux")]
fn clock_ms(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        // Only reachable with an invalid clock id; both ids used here are
        // compile-time constants.
        return 0;
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(target_os = "linux")]
impl Clock for SystemClock {
    fn elapsed_realtime_ms(&self) -> u64 {
        clock_ms(libc::CLOCK_BOOTTIME)
    }

    fn uptime_ms(&self) -> u64 {
        clock_ms(libc::CLOCK_MONOTONIC)
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// Without CLOCK_BOOTTIME the two clocks collapse into one monotonic source
// and deep-sleep time reads as zero.
#[cfg(not(target_os = "linux"))]
impl Clock for SystemClock {
    fn elapsed_realtime_ms(&self) -> u64 {
        process_monotonic_ms()
    }

    fn uptime_ms(&self) -> u64 {
        process_monotonic_ms()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(not(target_os = "linux"))]
fn process_monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
pub mod testing {
    use super::Clock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    /// Hand-stepped clock for tests. Cloning shares the underlying time.
    #[derive(Clone, Default)]
    pub struct ManualClock {
        inner: Arc<Mutex<State>>,
    }

    #[derive(Default)]
    struct State {
        elapsed_ms: u64,
        uptime_ms: u64,
    }

    impl ManualClock {
        pub fn at(elapsed_ms: u64, uptime_ms: u64) -> Self {
            Self {
                inner: Arc::new(Mutex::new(State {
                    elapsed_ms,
                    uptime_ms,
                })),
            }
        }

        /// Advance both clocks: the machine is awake.
        pub fn advance(&self, ms: u64) {
            let mut state = self.inner.lock().unwrap();
            state.elapsed_ms += ms;
            state.uptime_ms += ms;
        }

        /// Advance only elapsed-realtime: the machine is in deep sleep.
        pub fn advance_asleep(&self, ms: u64) {
            self.inner.lock().unwrap().elapsed_ms += ms;
        }

        /// Jump both clocks back to small values, as a reboot would.
        pub fn reboot_to(&self, elapsed_ms: u64, uptime_ms: u64) {
            let mut state = self.inner.lock().unwrap();
            state.elapsed_ms = elapsed_ms;
            state.uptime_ms = uptime_ms;
        }
    }

    impl Clock for ManualClock {
        fn elapsed_realtime_ms(&self) -> u64 {
            self.inner.lock().unwrap().elapsed_ms
        }

        fn uptime_ms(&self) -> u64 {
            self.inner.lock().unwrap().uptime_ms
        }

        fn wall(&self) -> DateTime<Utc> {
            let elapsed = self.inner.lock().unwrap().elapsed_ms;
            Utc.timestamp_millis_opt(elapsed as i64).unwrap()
        }
    }
}

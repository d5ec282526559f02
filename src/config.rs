use std::env;
use std::time::Duration;
use tracing::warn;

/// Minimum time a process stays evicted before a restore is attempted.
pub const PROCESS_RESTORE_TIME_MS: u64 = 100;
/// Spacing between restore attempts after a failed BO restore.
pub const PROCESS_BACK_OFF_TIME_MS: u64 = 100;
/// Time a freshly restored process is allowed to run before it is evicted again.
pub const PROCESS_ACTIVE_TIME_MS: u64 = 10;

/// Widest PASID space the manager accepts.
pub const MAX_PASID_BITS: u32 = 20;

const DEFAULT_PASID_BITS: u32 = 16;
const DEFAULT_PROCESS_WQ_WORKERS: usize = 4;

/// Module-scope switches and tunables of the process manager.
#[derive(Debug, Clone, Copy)]
pub struct ProcessConfig {
    /// Unmap doorbells of an evicted process whose queues are idle and keep it evicted.
    pub keep_idle_process_evicted: bool,
    /// Raise eviction/restore logging to `info` and warn on system-wide eviction.
    pub debug_evictions: bool,
    pub restore_time: Duration,
    pub back_off_time: Duration,
    pub active_time: Duration,
    pub pasid_bits: u32,
    pub process_wq_workers: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keep_idle_process_evicted: false,
            debug_evictions: false,
            restore_time: Duration::from_millis(PROCESS_RESTORE_TIME_MS),
            back_off_time: Duration::from_millis(PROCESS_BACK_OFF_TIME_MS),
            active_time: Duration::from_millis(PROCESS_ACTIVE_TIME_MS),
            pasid_bits: DEFAULT_PASID_BITS,
            process_wq_workers: DEFAULT_PROCESS_WQ_WORKERS,
        }
    }

    #[must_use]
    pub const fn keep_idle_process_evicted(mut self, enabled: bool) -> Self {
        self.keep_idle_process_evicted = enabled;
        self
    }

    #[must_use]
    pub const fn debug_evictions(mut self, enabled: bool) -> Self {
        self.debug_evictions = enabled;
        self
    }

    #[must_use]
    pub const fn restore_time(mut self, time: Duration) -> Self {
        self.restore_time = time;
        self
    }

    #[must_use]
    pub const fn back_off_time(mut self, time: Duration) -> Self {
        self.back_off_time = time;
        self
    }

    #[must_use]
    pub const fn active_time(mut self, time: Duration) -> Self {
        self.active_time = time;
        self
    }

    /// Width of the PASID space, `1..=MAX_PASID_BITS`. Checked by `Kfd::new`.
    #[must_use]
    pub const fn pasid_bits(mut self, bits: u32) -> Self {
        self.pasid_bits = bits;
        self
    }

    #[must_use]
    pub const fn process_wq_workers(mut self, workers: usize) -> Self {
        self.process_wq_workers = workers;
        self
    }

    /// Defaults overridden by `KFD_*` environment variables, the userspace stand-in for
    /// module parameters.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::new();

        if let Some(v) = env_flag("KFD_KEEP_IDLE_PROCESS_EVICTED") {
            cfg.keep_idle_process_evicted = v;
        }
        if let Some(v) = env_flag("KFD_DEBUG_EVICTIONS") {
            cfg.debug_evictions = v;
        }
        if let Some(ms) = env_number("KFD_PROCESS_RESTORE_TIME_MS") {
            cfg.restore_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("KFD_PROCESS_BACK_OFF_TIME_MS") {
            cfg.back_off_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("KFD_PROCESS_ACTIVE_TIME_MS") {
            cfg.active_time = Duration::from_millis(ms);
        }
        if let Some(bits) = env_number("KFD_PASID_BITS") {
            match u32::try_from(bits) {
                Ok(b) if (1..=MAX_PASID_BITS).contains(&b) => cfg.pasid_bits = b,
                _ => warn!(bits, "KFD_PASID_BITS out of range, keeping default"),
            }
        }

        cfg
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim() {
        "1" | "y" | "Y" | "true" => Some(true),
        "0" | "n" | "N" | "false" => Some(false),
        other => {
            warn!(key, value = other, "ignoring malformed boolean");
            None
        }
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw.as_str(), "ignoring malformed number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ProcessConfig::new()
            .keep_idle_process_evicted(true)
            .restore_time(Duration::from_millis(5))
            .pasid_bits(4);

        assert!(cfg.keep_idle_process_evicted);
        assert!(!cfg.debug_evictions);
        assert_eq!(cfg.restore_time, Duration::from_millis(5));
        assert_eq!(cfg.back_off_time, Duration::from_millis(PROCESS_BACK_OFF_TIME_MS));
        assert_eq!(cfg.pasid_bits, 4);
    }
}

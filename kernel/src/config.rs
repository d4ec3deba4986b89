//! Boot-time configuration of the concurrency core.

use core::time::Duration;

use nos_api::{Error, Result, Ticks};

/// Sizing and timing parameters fixed at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs the core schedules on
    pub cpu_count: usize,
    /// Clock ticks per second
    pub hz: u32,
    /// Capacity of the thread object pool
    pub max_threads: usize,
    /// Capacity of the futex object pool
    pub max_futexes: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            hz: 100,
            max_threads: 1024,
            max_futexes: 4096,
        }
    }
}

impl KernelConfig {
    /// Set the number of CPUs.
    pub fn with_cpus(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    /// Set the clock frequency.
    pub fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    /// Set the thread pool capacity.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the futex pool capacity.
    pub fn with_max_futexes(mut self, max_futexes: usize) -> Self {
        self.max_futexes = max_futexes;
        self
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 {
            return Err(Error::ConfigError("cpu_count must be at least 1"));
        }
        if self.hz == 0 {
            return Err(Error::ConfigError("hz must be at least 1"));
        }
        if self.max_threads == 0 {
            return Err(Error::ConfigError("max_threads must be at least 1"));
        }
        if self.max_futexes == 0 {
            return Err(Error::ConfigError("max_futexes must be at least 1"));
        }
        Ok(())
    }

    /// Convert a duration to clock ticks, rounding up. Any non-zero request
    /// lasts at least one tick.
    pub fn ticks_from(&self, duration: Duration) -> Ticks {
        let ticks = (duration.as_micros() * u128::from(self.hz)).div_ceil(1_000_000);
        Ticks::try_from(ticks).unwrap_or(Ticks::MAX).max(1)
    }

    /// Convert clock ticks back to wall time.
    pub fn duration_from(&self, ticks: Ticks) -> Duration {
        Duration::from_micros(ticks.saturating_mul(1_000_000) / u64::from(self.hz))
    }
}

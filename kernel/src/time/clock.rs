//! Clock tick entry point.

use core::sync::atomic::Ordering;
use core::time::Duration;

use nos_api::{CpuId, Error, Result};

use crate::kernel::Kernel;
use crate::process::thread::ThreadState;

impl Kernel {
    /// Clock interrupt handler of the calling CPU.
    ///
    /// Runs the timeouts that became due (once for every tick the platform
    /// reported as missed, plus this one), then charges the elapsed ticks
    /// to the current thread and preempts it once its slice is used up.
    pub fn clock(&self) {
        let cpu = self.current_cpu();
        let missed = cpu.missed_clock_ticks.swap(0, Ordering::AcqRel);

        for _ in 0..=missed {
            cpu.uptime.fetch_add(1, Ordering::AcqRel);
            cpu.timeouts.tick(self);
        }

        let Some(thread) = self.current_thread() else {
            return;
        };
        let mut t = thread.lock();
        if t.state != ThreadState::Running {
            return;
        }
        t.ticks = t.ticks.saturating_sub(missed + 1);
        if t.ticks == 0 && !thread.preemption_disabled() {
            cpu.stats.record_preemption();
            log::trace!("thread {} preempted on cpu{}", thread.id(), cpu.id());
            self.schedule(&thread, t);
        }
    }

    /// Record clock ticks the platform could not deliver on `cpu`. They are
    /// processed by the next [`clock`](Self::clock) on that CPU.
    pub fn note_missed_ticks(&self, cpu: CpuId, ticks: u64) -> Result<()> {
        let cpu = self
            .cpu(cpu)
            .ok_or(Error::InvalidArgument("cpu index out of range"))?;
        cpu.missed_clock_ticks.fetch_add(ticks, Ordering::AcqRel);
        Ok(())
    }

    /// Time since boot as counted by the clock of CPU 0.
    pub fn uptime(&self) -> Duration {
        let ticks = self.cpu(0).map_or(0, |cpu| cpu.uptime_ticks());
        self.config().duration_from(ticks)
    }
}

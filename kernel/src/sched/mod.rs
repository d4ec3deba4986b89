//! Ready queues and the dispatch contract.
//!
//! Each CPU keeps one FIFO per priority level plus a bitmap of non-empty
//! levels, so picking the next thread is O(1). Level 0 is dispatched
//! first. Which CPU polls which queue, and when, belongs to the platform;
//! the core only makes threads ready, hands out the best one and switches
//! away from the current one.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::array;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use nos_api::{CpuId, Error, Result, Ticks};
use static_assertions::const_assert;

use crate::arch::IrqGuard;
use crate::kernel::Kernel;
use crate::process::thread::{Thread, ThreadFlags, ThreadGuard, ThreadInner, ThreadState};

/// Number of ready queues per CPU
pub const RQ_COUNT: usize = 16;

const_assert!(RQ_COUNT <= u64::BITS as usize);

/// Time slice granted for one dispatch from level `level`
pub const fn slice_for_level(level: usize) -> Duration {
    Duration::from_millis(10 * (level as u64 + 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    InvalidPriority,
}

/// Per-CPU ready queues.
pub(crate) struct RunQueues {
    queues: [VecDeque<Arc<Thread>>; RQ_COUNT],
    bitmap: u64,
    len: usize,
}

impl RunQueues {
    pub(crate) fn new() -> Self {
        Self {
            queues: array::from_fn(|_| VecDeque::new()),
            bitmap: 0,
            len: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, thread: Arc<Thread>, level: usize) -> core::result::Result<(), SchedulerError> {
        if level >= RQ_COUNT {
            return Err(SchedulerError::InvalidPriority);
        }
        self.queues[level].push_back(thread);
        self.bitmap |= 1u64 << level;
        self.len += 1;
        Ok(())
    }

    pub(crate) fn pick_next(&mut self) -> Option<(Arc<Thread>, usize)> {
        let level = Self::best_level(self.bitmap)?;
        let queue = &mut self.queues[level];
        let thread = queue.pop_front();
        if queue.is_empty() {
            self.bitmap &= !(1u64 << level);
        }
        if thread.is_some() {
            self.len -= 1;
        }
        thread.map(|t| (t, level))
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn best_level(bitmap: u64) -> Option<usize> {
        if bitmap == 0 {
            None
        } else {
            Some(bitmap.trailing_zeros() as usize)
        }
    }
}

/// Dispatch counters of one CPU.
#[derive(Debug)]
pub struct SchedulerStats {
    pub dispatches: AtomicU64,
    pub preemptions: AtomicU64,
    pub voluntary_switches: AtomicU64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
        }
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_voluntary(&self) {
        self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            voluntary_switches: self.voluntary_switches.load(Ordering::Relaxed),
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatches: u64,
    pub preemptions: u64,
    pub voluntary_switches: u64,
}

impl Kernel {
    /// Make a created or sleeping thread runnable.
    ///
    /// Every readying ages the thread by one level (saturating at the last
    /// queue). The thread goes to the ready queue of the calling CPU, or of
    /// the CPU it last ran on when it is wired.
    pub fn thread_ready(&self, thread: &Arc<Thread>) {
        let cpu = {
            let _irq = IrqGuard::new(self.machine());
            let mut t = thread.lock();
            if !matches!(t.state, ThreadState::Entering | ThreadState::Sleeping) {
                log::error!("thread {} readied in state {:?}", thread.id(), t.state);
                panic!("thread_ready: invalid thread state");
            }
            self.make_ready(thread, &mut t)
        };
        self.machine().reschedule(cpu);
    }

    /// Queue `thread` as ready. The caller holds the thread lock.
    pub(crate) fn make_ready(&self, thread: &Arc<Thread>, t: &mut ThreadInner) -> CpuId {
        let level = match t.priority {
            None => 0,
            Some(p) if p + 1 < RQ_COUNT => p + 1,
            Some(p) => p,
        };
        t.priority = Some(level);

        let here = self.machine().cpu_id();
        let cpu_id = if thread.flags().contains(ThreadFlags::WIRED) {
            t.cpu.unwrap_or(here)
        } else {
            here
        };
        let Some(cpu) = self.cpu(cpu_id) else {
            log::error!("thread {} readied on unknown cpu{}", thread.id(), cpu_id);
            panic!("make_ready: cpu index out of range");
        };

        t.state = ThreadState::Ready;
        t.cpu = Some(cpu_id);
        if cpu.runq.lock().enqueue(thread.clone(), level).is_err() {
            panic!("make_ready: priority level {} out of range", level);
        }
        self.nrdy.fetch_add(1, Ordering::AcqRel);
        cpu.nrdy.fetch_add(1, Ordering::AcqRel);
        cpu_id
    }

    /// Take the best ready thread of `cpu` and mark it running there.
    ///
    /// Platforms call this from their dispatch loop; the returned thread
    /// must be switched to.
    pub fn find_best_thread(&self, cpu_id: CpuId) -> Result<Option<Arc<Thread>>> {
        let cpu = self
            .cpu(cpu_id)
            .ok_or(Error::InvalidArgument("cpu index out of range"))?;
        let _irq = IrqGuard::new(self.machine());

        let Some((thread, level)) = cpu.runq.lock().pick_next() else {
            return Ok(None);
        };
        self.nrdy.fetch_sub(1, Ordering::AcqRel);
        cpu.nrdy.fetch_sub(1, Ordering::AcqRel);

        let slice: Ticks = self.config().ticks_from(slice_for_level(level));
        let mut t = thread.lock();
        t.state = ThreadState::Running;
        t.cpu = Some(cpu_id);
        t.ticks = slice;
        drop(t);

        cpu.stats.record_dispatch();
        Ok(Some(thread))
    }

    /// Switch away from `thread`, which is the caller and whose lock is
    /// held with its next state already decided. A running thread goes
    /// back to the ready queue; a sleeping one waits for its wakeup.
    pub(crate) fn schedule(&self, thread: &Arc<Thread>, mut t: ThreadGuard<'_>) {
        match t.state {
            ThreadState::Running => {
                self.make_ready(thread, &mut t);
            }
            ThreadState::Sleeping => {}
            state => {
                log::error!("thread {} scheduled away in state {:?}", thread.id(), state);
                panic!("schedule: invalid thread state");
            }
        }
        self.machine().switch_away(thread, t);
    }

    /// Give up the CPU voluntarily.
    pub fn thread_yield(&self) {
        let thread = self.expect_current("thread_yield");
        let _irq = IrqGuard::new(self.machine());
        let t = thread.lock();
        self.current_cpu().stats.record_voluntary();
        self.schedule(&thread, t);
    }

    /// Ready threads across all CPUs
    pub fn nrdy(&self) -> usize {
        self.nrdy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_selects_lowest_level() {
        assert_eq!(RunQueues::best_level(0), None);
        assert_eq!(RunQueues::best_level(0b1000), Some(3));
        assert_eq!(RunQueues::best_level(0b1010), Some(1));
        assert_eq!(RunQueues::best_level(1 << (RQ_COUNT - 1)), Some(RQ_COUNT - 1));
    }

    #[test]
    fn slices_grow_with_level() {
        assert_eq!(slice_for_level(0), Duration::from_millis(10));
        assert_eq!(slice_for_level(RQ_COUNT - 1), Duration::from_millis(160));
    }
}

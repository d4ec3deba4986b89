//! Per-CPU state owned by the core.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use nos_api::{CpuId, Ticks};
use spin::Mutex;

use crate::sched::{RunQueues, SchedulerStats};
use crate::time::timeout::TimeoutQueue;

/// State of one CPU: its timeouts, ready queues and counters.
pub struct Cpu {
    id: CpuId,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) runq: Mutex<RunQueues>,
    pub(crate) nrdy: AtomicUsize,
    pub(crate) missed_clock_ticks: AtomicU64,
    pub(crate) uptime: AtomicU64,
    pub(crate) stats: SchedulerStats,
}

impl Cpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            timeouts: TimeoutQueue::new(id),
            runq: Mutex::new(RunQueues::new()),
            nrdy: AtomicUsize::new(0),
            missed_clock_ticks: AtomicU64::new(0),
            uptime: AtomicU64::new(0),
            stats: SchedulerStats::new(),
        }
    }

    /// CPU index
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Number of threads waiting in this CPU's ready queues
    pub fn nrdy(&self) -> usize {
        self.nrdy.load(Ordering::Acquire)
    }

    /// Clock ticks processed on this CPU
    pub fn uptime_ticks(&self) -> Ticks {
        self.uptime.load(Ordering::Acquire)
    }

    /// Armed timeouts on this CPU
    pub fn armed_timeouts(&self) -> usize {
        self.timeouts.armed()
    }

    /// Scheduler counters of this CPU
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

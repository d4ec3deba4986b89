//! Counting semaphore over a wait queue.

use core::time::Duration;

use crate::kernel::Kernel;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::{WaitQueue, WakeMode};

/// Counting semaphore. The count lives in the wait queue as banked wakeups.
#[derive(Debug)]
pub struct Semaphore {
    wq: WaitQueue,
}

impl Semaphore {
    /// Semaphore that can be downed `count` times without blocking.
    pub fn new(count: usize) -> Self {
        Self {
            wq: WaitQueue::with_missed_wakeups(count),
        }
    }

    /// Down, blocking as long as needed.
    pub fn down(&self, kernel: &Kernel) {
        let rc = self.down_timeout(kernel, None, SynchFlags::empty());
        if rc.failed() {
            panic!("semaphore down without timeout or interruption failed: {:?}", rc);
        }
    }

    /// Down with an optional timeout.
    pub fn down_timeout(&self, kernel: &Kernel, timeout: Option<Duration>, flags: SynchFlags) -> SleepResult {
        self.wq.sleep(kernel, timeout, flags)
    }

    /// Down only if that does not block.
    pub fn try_down(&self, kernel: &Kernel) -> bool {
        self.down_timeout(kernel, None, SynchFlags::NON_BLOCKING).succeeded()
    }

    /// Up, waking the longest waiting thread if there is one.
    pub fn up(&self, kernel: &Kernel) {
        self.wq.wakeup(kernel, WakeMode::First);
    }

    /// Downs that would currently succeed without blocking
    pub fn count(&self) -> usize {
        self.wq.missed_wakeups()
    }

    pub(crate) fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }
}

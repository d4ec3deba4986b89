//! Condition variables.

use core::time::Duration;

use crate::kernel::Kernel;
use crate::sync::mutex::MutexGuard;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::{WaitQueue, WakeMode};

/// Condition variable used together with a [`Mutex`](crate::Mutex).
#[derive(Debug, Default)]
pub struct Condvar {
    wq: WaitQueue,
}

impl Condvar {
    pub fn new() -> Self {
        Self { wq: WaitQueue::new() }
    }

    /// Wake one waiter.
    pub fn signal(&self, kernel: &Kernel) {
        self.wq.wakeup(kernel, WakeMode::First);
    }

    /// Wake every waiter.
    pub fn broadcast(&self, kernel: &Kernel) {
        self.wq.wakeup(kernel, WakeMode::All);
    }

    /// Release the mutex, sleep until signalled and take the mutex again.
    pub fn wait<'a>(&self, guard: MutexGuard<'a>) -> MutexGuard<'a> {
        let (guard, rc) = self.wait_timeout(guard, None, SynchFlags::empty());
        if rc.failed() {
            panic!("condvar wait without timeout or interruption failed: {:?}", rc);
        }
        guard
    }

    /// [`wait`](Self::wait) with an optional timeout. The mutex is held
    /// again on return whatever the outcome.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a>,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> (MutexGuard<'a>, SleepResult) {
        let kernel = guard.kernel();
        let mutex = guard.mutex();

        // The queue is locked before the mutex is released, so a signal sent
        // right after the unlock finds us queued.
        let mut prepared = self.wq.sleep_prepare(kernel);
        drop(guard);
        prepared.clear_missed_wakeups();
        let rc = prepared.sleep(timeout, flags);

        (mutex.lock(kernel), rc)
    }
}

//! Sleeping mutex.

use core::fmt;
use core::time::Duration;

use nos_api::Result;

use crate::kernel::Kernel;
use crate::sync::semaphore::Semaphore;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::WaitQueue;

/// Binary semaphore with RAII unlocking.
///
/// May only be taken from thread context; interrupt handlers and timeout
/// callbacks must use spin locks.
pub struct Mutex {
    sem: Semaphore,
}

/// Held [`Mutex`]. Unlocks on drop.
#[must_use = "dropping the guard unlocks the mutex"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    kernel: &'a Kernel,
}

impl Mutex {
    pub fn new() -> Self {
        Self { sem: Semaphore::new(1) }
    }

    /// Lock, blocking as long as needed.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> MutexGuard<'a> {
        self.sem.down(kernel);
        MutexGuard { mutex: self, kernel }
    }

    /// Lock with an optional timeout. Fails with `WouldBlock`, `TimedOut`
    /// or `Interrupted`.
    pub fn lock_timeout<'a>(
        &'a self,
        kernel: &'a Kernel,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<MutexGuard<'a>> {
        self.acquire(kernel, timeout, flags).into_result()?;
        Ok(MutexGuard { mutex: self, kernel })
    }

    pub fn try_lock<'a>(&'a self, kernel: &'a Kernel) -> Option<MutexGuard<'a>> {
        self.sem.try_down(kernel).then(|| MutexGuard { mutex: self, kernel })
    }

    pub fn is_locked(&self) -> bool {
        self.sem.count() == 0
    }

    /// Take the mutex without a guard; the caller releases it by other means.
    pub(crate) fn acquire(&self, kernel: &Kernel, timeout: Option<Duration>, flags: SynchFlags) -> SleepResult {
        self.sem.down_timeout(kernel, timeout, flags)
    }

    pub(crate) fn wait_queue(&self) -> &WaitQueue {
        self.sem.wait_queue()
    }

    fn unlock(&self, kernel: &Kernel) {
        self.sem.up(kernel);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("locked", &self.is_locked()).finish()
    }
}

impl<'a> MutexGuard<'a> {
    pub(crate) fn mutex(&self) -> &'a Mutex {
        self.mutex
    }

    pub(crate) fn kernel(&self) -> &'a Kernel {
        self.kernel
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.kernel);
    }
}

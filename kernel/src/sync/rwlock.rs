//! Read-write lock.
//!
//! A reader count in front of a mutex. The first reader takes the mutex on
//! behalf of all readers; later readers only bump the count, as long as no
//! one is queued on the mutex. A queued writer therefore stops new readers
//! from slipping past it.
//!
//! Releases hand the mutex over explicitly: to the writer at the head of
//! the mutex queue, or to every reader at the head, counting them in before
//! they even run.

use core::fmt;
use core::time::Duration;

use nos_api::Result;
use spin::Mutex as SpinMutex;

use crate::arch::IrqGuard;
use crate::kernel::Kernel;
use crate::process::thread::RwLockHolder;
use crate::sync::mutex::Mutex;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::{WaitQueue, WakeMode};

/// Read-write lock with writer preference over newly arriving readers.
pub struct RwLock {
    /// Readers inside the critical section
    readers_in: SpinMutex<usize>,
    exclusive: Mutex,
}

/// Shared access to an [`RwLock`]. Released on drop.
#[must_use = "dropping the guard releases the lock"]
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
    kernel: &'a Kernel,
}

/// Exclusive access to an [`RwLock`]. Released on drop.
#[must_use = "dropping the guard releases the lock"]
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
    kernel: &'a Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    All,
    ReadersOnly,
}

impl RwLock {
    pub fn new() -> Self {
        Self {
            readers_in: SpinMutex::new(0),
            exclusive: Mutex::new(),
        }
    }

    /// Readers currently holding the lock
    pub fn readers(&self) -> usize {
        *self.readers_in.lock()
    }

    pub fn write<'a>(&'a self, kernel: &'a Kernel) -> RwLockWriteGuard<'a> {
        match self.write_timeout(kernel, None, SynchFlags::empty()) {
            Ok(guard) => guard,
            Err(err) => panic!("rwlock write without timeout or interruption failed: {}", err),
        }
    }

    pub fn read<'a>(&'a self, kernel: &'a Kernel) -> RwLockReadGuard<'a> {
        match self.read_timeout(kernel, None, SynchFlags::empty()) {
            Ok(guard) => guard,
            Err(err) => panic!("rwlock read without timeout or interruption failed: {}", err),
        }
    }

    pub fn try_write<'a>(&'a self, kernel: &'a Kernel) -> Option<RwLockWriteGuard<'a>> {
        self.write_timeout(kernel, None, SynchFlags::NON_BLOCKING).ok()
    }

    pub fn try_read<'a>(&'a self, kernel: &'a Kernel) -> Option<RwLockReadGuard<'a>> {
        self.read_timeout(kernel, None, SynchFlags::NON_BLOCKING).ok()
    }

    /// Exclusive access with an optional timeout.
    pub fn write_timeout<'a>(
        &'a self,
        kernel: &'a Kernel,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<RwLockWriteGuard<'a>> {
        set_holder(kernel, RwLockHolder::Writer);

        let rc = self.exclusive.acquire(kernel, timeout, flags);
        if rc.failed() {
            // Readers may have queued behind us while we waited; if readers
            // hold the lock they can go in now.
            let _irq = IrqGuard::new(kernel.machine());
            let mut readers_in = self.readers_in.lock();
            if *readers_in > 0 {
                self.let_others_in(kernel, &mut readers_in, Admit::ReadersOnly);
            }
        }
        rc.into_result()?;
        Ok(RwLockWriteGuard { lock: self, kernel })
    }

    /// Shared access with an optional timeout.
    pub fn read_timeout<'a>(
        &'a self,
        kernel: &'a Kernel,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<RwLockReadGuard<'a>> {
        set_holder(kernel, RwLockHolder::Reader);

        let irq = IrqGuard::new(kernel.machine());
        let mut readers_in = self.readers_in.lock();

        let admitted = self.exclusive.acquire(kernel, None, SynchFlags::NON_BLOCKING).succeeded()
            || (*readers_in > 0 && self.exclusive.wait_queue().lock_list().is_empty());
        if admitted {
            *readers_in += 1;
            return Ok(RwLockReadGuard { lock: self, kernel });
        }

        // Queue on the mutex before dropping the reader count lock, so the
        // next release sees us and counts us in.
        let prepared = self.exclusive.wait_queue().sleep_prepare(kernel);
        drop(readers_in);
        let rc = prepared.sleep(timeout, flags);
        drop(irq);

        // A woken reader has already been counted in by the releaser.
        if rc == SleepResult::OkAtomic {
            log::error!("reader acquired a contended rwlock without blocking");
            panic!("rwlock: impossible atomic acquisition");
        }
        rc.into_result()?;
        Ok(RwLockReadGuard { lock: self, kernel })
    }

    fn read_unlock(&self, kernel: &Kernel) {
        let _irq = IrqGuard::new(kernel.machine());
        let mut readers_in = self.readers_in.lock();
        *readers_in = match readers_in.checked_sub(1) {
            Some(n) => n,
            None => panic!("rwlock: reader count underflow"),
        };
        if *readers_in == 0 {
            self.let_others_in(kernel, &mut readers_in, Admit::All);
        }
    }

    fn write_unlock(&self, kernel: &Kernel) {
        let _irq = IrqGuard::new(kernel.machine());
        let mut readers_in = self.readers_in.lock();
        self.let_others_in(kernel, &mut readers_in, Admit::All);
    }

    /// Pass the exclusive mutex on. Called with the reader count locked.
    ///
    /// With [`Admit::All`] the head writer, or the run of readers at the
    /// head, is woken; an empty queue banks the wakeup, which unlocks the
    /// mutex. With [`Admit::ReadersOnly`] only leading readers are let in.
    fn let_others_in(&self, kernel: &Kernel, readers_in: &mut usize, admit: Admit) {
        let mut list = self.exclusive.wait_queue().lock_list();
        let mut head = list.front().map(|t| t.lock().rwlock_holder);
        loop {
            let holder = head.unwrap_or(RwLockHolder::None);
            if admit == Admit::ReadersOnly && holder != RwLockHolder::Reader {
                break;
            }
            if holder == RwLockHolder::Reader {
                *readers_in += 1;
            }
            WaitQueue::wakeup_locked(kernel, &mut list, WakeMode::First);

            head = list.front().map(|t| t.lock().rwlock_holder);
            if holder != RwLockHolder::Reader || head != Some(RwLockHolder::Reader) {
                break;
            }
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.readers())
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

fn set_holder(kernel: &Kernel, holder: RwLockHolder) {
    if let Some(thread) = kernel.current_thread() {
        let _irq = IrqGuard::new(kernel.machine());
        thread.lock().rwlock_holder = holder;
    }
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock(self.kernel);
    }
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock(self.kernel);
    }
}

//! Wait queues
//!
//! A wait queue is a FIFO of sleeping threads plus a count of wakeups that
//! found nobody to wake. A banked wakeup is consumed by the next sleeper
//! without blocking, which closes the window between checking a condition
//! and going to sleep on it.
//!
//! A sleeping thread can leave its queue three ways: a wakeup pops it, its
//! timeout expires, or it is interrupted. The wakeup path holds the queue
//! and then locks the thread. The other two start from the thread and do
//! not know the queue in advance, so they lock the thread, look up the
//! queue it sleeps in and only try its lock, starting over on failure.
//! Whichever path takes the thread off the queue first wins; the others
//! find it no longer sleeping and do nothing.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;

use nos_api::ThreadId;
use spin::{Mutex, MutexGuard};

use crate::arch::IrqGuard;
use crate::kernel::Kernel;
use crate::process::thread::{Thread, ThreadInner, ThreadState, WakeReason};
use crate::sync::synch::{SleepResult, SynchFlags};

/// Which sleepers a wakeup releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    /// The longest waiting sleeper, or bank one wakeup if there is none
    First,
    /// Every sleeper; also forgets banked wakeups
    All,
}

/// Sleepers and banked wakeups, protected by the queue lock.
pub struct WaitList {
    sleepers: VecDeque<Arc<Thread>>,
    missed_wakeups: usize,
}

impl WaitList {
    /// Number of sleepers
    pub fn len(&self) -> usize {
        self.sleepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }

    pub fn missed_wakeups(&self) -> usize {
        self.missed_wakeups
    }

    pub(crate) fn front(&self) -> Option<&Arc<Thread>> {
        self.sleepers.front()
    }

    fn unlink(&mut self, thread: &Arc<Thread>) {
        let Some(pos) = self.sleepers.iter().position(|t| Arc::ptr_eq(t, thread)) else {
            log::error!("thread {} claims a wait queue it is not linked into", thread.id());
            panic!("wait queue corrupted");
        };
        self.sleepers.remove(pos);
    }
}

/// Shared part of a wait queue. Sleeping threads point back here weakly.
pub struct WaitQueueInner {
    list: Mutex<WaitList>,
}

/// Queue of threads waiting for an event.
pub struct WaitQueue {
    inner: Arc<WaitQueueInner>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::with_missed_wakeups(0)
    }

    /// Queue starting with `missed` banked wakeups.
    pub(crate) fn with_missed_wakeups(missed: usize) -> Self {
        Self {
            inner: Arc::new(WaitQueueInner {
                list: Mutex::new(WaitList {
                    sleepers: VecDeque::new(),
                    missed_wakeups: missed,
                }),
            }),
        }
    }

    /// Number of threads sleeping in the queue
    pub fn sleepers(&self) -> usize {
        self.inner.list.lock().len()
    }

    /// Wakeups banked for future sleepers
    pub fn missed_wakeups(&self) -> usize {
        self.inner.list.lock().missed_wakeups
    }

    pub(crate) fn lock_list(&self) -> MutexGuard<'_, WaitList> {
        self.inner.list.lock()
    }

    pub(crate) fn try_lock_list(&self) -> Option<MutexGuard<'_, WaitList>> {
        self.inner.list.try_lock()
    }

    /// First half of a sleep: wait out any timeout handler still running
    /// for the caller, disable interrupts and lock the queue.
    ///
    /// Lets callers do work between locking the queue and sleeping on it,
    /// such as releasing the mutex protecting a condition.
    pub fn sleep_prepare<'a>(&'a self, kernel: &'a Kernel) -> SleepGuard<'a> {
        let current = kernel.current_thread();
        loop {
            let irq = IrqGuard::new(kernel.machine());
            if let Some(thread) = current.as_ref() {
                // The previous sleep's timeout handler clears the flag when it
                // finishes; it never blocks, so this terminates.
                if thread.lock().timeout_pending {
                    drop(irq);
                    core::hint::spin_loop();
                    continue;
                }
            }
            return SleepGuard {
                kernel,
                wq: self,
                list: self.inner.list.lock(),
                _irq: irq,
            };
        }
    }

    /// Sleep until woken, timed out or (with
    /// [`SynchFlags::INTERRUPTIBLE`]) interrupted.
    pub fn sleep(&self, kernel: &Kernel, timeout: Option<Duration>, flags: SynchFlags) -> SleepResult {
        self.sleep_prepare(kernel).sleep(timeout, flags)
    }

    /// Wake sleepers. Returns how many threads were made ready.
    pub fn wakeup(&self, kernel: &Kernel, mode: WakeMode) -> usize {
        let _irq = IrqGuard::new(kernel.machine());
        let mut list = self.inner.list.lock();
        Self::wakeup_locked(kernel, &mut list, mode)
    }

    /// [`wakeup`](Self::wakeup) on an already locked queue.
    pub(crate) fn wakeup_locked(kernel: &Kernel, list: &mut WaitList, mode: WakeMode) -> usize {
        match mode {
            WakeMode::First => match list.sleepers.pop_front() {
                Some(thread) => {
                    Self::resume(kernel, &thread);
                    1
                }
                None => {
                    list.missed_wakeups += 1;
                    0
                }
            },
            WakeMode::All => {
                let mut woken = 0;
                while let Some(thread) = list.sleepers.pop_front() {
                    Self::resume(kernel, &thread);
                    woken += 1;
                }
                list.missed_wakeups = 0;
                woken
            }
        }
    }

    /// Hand a thread just popped off a queue back to the scheduler.
    fn resume(kernel: &Kernel, thread: &Arc<Thread>) {
        {
            let mut t = thread.lock();
            if t.state != ThreadState::Sleeping {
                log::error!("thread {} woken in state {:?}", thread.id(), t.state);
                panic!("wakeup of a thread that is not sleeping");
            }
            cancel_timeout(kernel, &mut t);
            t.sleep_queue = None;
            t.wake_reason = Some(WakeReason::Woken);
        }
        log::trace!("thread {} woken", thread.id());
        kernel.thread_ready(thread);
    }

    /// Interrupt the sleep of `thread` if it sleeps interruptibly. Returns
    /// whether the thread was taken off its queue.
    pub fn interrupt(kernel: &Kernel, thread: &Arc<Thread>) -> bool {
        let _irq = IrqGuard::new(kernel.machine());
        loop {
            let mut t = thread.lock();
            let Some(queue) = sleeping_in(thread, &t) else {
                return false;
            };
            if !t.sleep_interruptible {
                return false;
            }
            let Some(mut list) = queue.list.try_lock() else {
                drop(t);
                core::hint::spin_loop();
                continue;
            };
            cancel_timeout(kernel, &mut t);
            list.unlink(thread);
            t.sleep_queue = None;
            t.wake_reason = Some(WakeReason::Interrupted);
            drop(list);
            drop(t);

            log::trace!("thread {} interrupted", thread.id());
            kernel.thread_ready(thread);
            return true;
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.inner.list.lock();
        f.debug_struct("WaitQueue")
            .field("sleepers", &list.len())
            .field("missed_wakeups", &list.missed_wakeups)
            .finish()
    }
}

/// Queue the thread sleeps in, if any.
fn sleeping_in(thread: &Thread, t: &ThreadInner) -> Option<Arc<WaitQueueInner>> {
    let weak = t.sleep_queue.as_ref()?;
    match weak.upgrade() {
        Some(queue) => Some(queue),
        None => {
            log::error!("thread {} sleeps in a wait queue that no longer exists", thread.id());
            panic!("sleeping thread has no valid wait queue");
        }
    }
}

/// Disarm the sleep timeout. If it is already firing, `timeout_pending`
/// stays set until its handler has finished.
fn cancel_timeout(kernel: &Kernel, t: &mut ThreadInner) {
    if !t.timeout_pending {
        return;
    }
    if let Some(handle) = t.sleep_timeout.take() {
        if kernel.timeout_unregister(handle) {
            t.timeout_pending = false;
        }
    }
}

/// A wait queue locked for sleeping, with interrupts disabled.
pub struct SleepGuard<'a> {
    kernel: &'a Kernel,
    wq: &'a WaitQueue,
    list: MutexGuard<'a, WaitList>,
    _irq: IrqGuard<'a>,
}

impl SleepGuard<'_> {
    /// Forget wakeups banked before the queue was locked.
    pub fn clear_missed_wakeups(&mut self) {
        self.list.missed_wakeups = 0;
    }

    /// Second half of a sleep, see [`WaitQueue::sleep`].
    pub fn sleep(mut self, timeout: Option<Duration>, flags: SynchFlags) -> SleepResult {
        if self.list.missed_wakeups > 0 {
            self.list.missed_wakeups -= 1;
            return SleepResult::OkAtomic;
        }
        if flags.contains(SynchFlags::NON_BLOCKING) && timeout.is_none() {
            return SleepResult::WouldBlock;
        }

        let kernel = self.kernel;
        let thread = kernel.expect_current("sleep");
        let mut t = thread.lock();

        if flags.contains(SynchFlags::INTERRUPTIBLE) {
            if t.interrupted {
                return SleepResult::Interrupted;
            }
            t.sleep_interruptible = true;
        } else {
            t.sleep_interruptible = false;
        }
        t.wake_reason = None;

        if let Some(timeout) = timeout {
            let ticks = kernel.config().ticks_from(timeout);
            let tid = thread.id();
            t.timeout_pending = true;
            t.sleep_timeout = Some(kernel.timeout_register(
                ticks,
                Box::new(move |kernel: &Kernel| kernel.sleep_timed_out(tid)),
            ));
        }

        self.list.sleepers.push_back(thread.clone());
        t.sleep_queue = Some(Arc::downgrade(&self.wq.inner));
        t.state = ThreadState::Sleeping;
        drop(self.list);

        log::trace!("thread {} sleeping", thread.id());
        kernel.current_cpu().stats.record_voluntary();
        kernel.schedule(&thread, t);

        let reason = thread.lock().wake_reason.take();
        match reason {
            Some(WakeReason::Woken) => SleepResult::OkBlocked,
            Some(WakeReason::TimedOut) => SleepResult::Timeout,
            Some(WakeReason::Interrupted) => SleepResult::Interrupted,
            None => {
                log::error!("thread {} resumed from sleep without a wake reason", thread.id());
                panic!("sleep resumed without being woken");
            }
        }
    }
}

impl Kernel {
    /// Timeout handler of a timed sleep.
    pub(crate) fn sleep_timed_out(&self, tid: ThreadId) {
        let Some(thread) = self.thread_find(tid) else {
            log::trace!("timeout of vanished thread {}", tid);
            return;
        };
        loop {
            let mut t = thread.lock();
            let Some(queue) = sleeping_in(&thread, &t) else {
                // Woken already; the waker lost the race to cancel us.
                t.timeout_pending = false;
                t.sleep_timeout = None;
                return;
            };
            let Some(mut list) = queue.list.try_lock() else {
                drop(t);
                core::hint::spin_loop();
                continue;
            };
            list.unlink(&thread);
            t.sleep_queue = None;
            t.wake_reason = Some(WakeReason::TimedOut);
            t.timeout_pending = false;
            t.sleep_timeout = None;
            drop(list);
            drop(t);

            log::trace!("thread {} timed out", thread.id());
            self.thread_ready(&thread);
            return;
        }
    }
}

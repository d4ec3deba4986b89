//! System-call surface of the concurrency core.
//!
//! Handlers take raw register values and return a status word: a positive
//! `ESYNCH_*` code for sleeps, a non-negative value for success elsewhere
//! and a negative errno for errors.

use core::time::Duration;

use nos_api::{Error, ThreadId, VirtAddr};

use crate::arch::UspaceArg;
use crate::kernel::Kernel;
use crate::process::thread::ThreadFlags;
use crate::sync::synch::{SleepResult, SynchFlags};

pub const ESYNCH_WOULD_BLOCK: isize = 1;
pub const ESYNCH_TIMEOUT: isize = 2;
pub const ESYNCH_INTERRUPTED: isize = 4;
pub const ESYNCH_OK_ATOMIC: isize = 8;
pub const ESYNCH_OK_BLOCKED: isize = 16;

pub const EOK: isize = 0;
pub const ENOENT: isize = -1;
pub const ENOMEM: isize = -2;
pub const ETIMEOUT: isize = -12;
pub const EINVAL: isize = -13;
pub const EBUSY: isize = -14;
pub const EINTR: isize = -16;
pub const EDEADLK: isize = -17;
pub const ESRCH: isize = -18;
pub const EAGAIN: isize = -19;

/// System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    ThreadCreate = 2,
    ThreadExit = 3,
    TaskGetId = 4,
    FutexSleep = 5,
    FutexWakeup = 6,
    PreemptControl = 25,
    ThreadJoin = 29,
}

impl TryFrom<usize> for Syscall {
    type Error = Error;

    fn try_from(id: usize) -> Result<Self, Error> {
        Ok(match id {
            2 => Syscall::ThreadCreate,
            3 => Syscall::ThreadExit,
            4 => Syscall::TaskGetId,
            5 => Syscall::FutexSleep,
            6 => Syscall::FutexWakeup,
            25 => Syscall::PreemptControl,
            29 => Syscall::ThreadJoin,
            _ => return Err(Error::InvalidArgument("unknown system call")),
        })
    }
}

/// Status code of a finished sleep
pub fn sleep_status(rc: SleepResult) -> isize {
    match rc {
        SleepResult::WouldBlock => ESYNCH_WOULD_BLOCK,
        SleepResult::Timeout => ESYNCH_TIMEOUT,
        SleepResult::Interrupted => ESYNCH_INTERRUPTED,
        SleepResult::OkAtomic => ESYNCH_OK_ATOMIC,
        SleepResult::OkBlocked => ESYNCH_OK_BLOCKED,
    }
}

/// Negative errno for an error
pub fn errno(err: Error) -> isize {
    match err {
        Error::OutOfMemory => ENOMEM,
        Error::NotMapped(_) | Error::NotPresent(_) => ENOENT,
        Error::InvalidArgument(_) | Error::InvalidState(_) | Error::ConfigError(_) => EINVAL,
        Error::WouldDeadlock => EDEADLK,
        Error::WouldBlock => EAGAIN,
        Error::TimedOut => ETIMEOUT,
        Error::Interrupted => EINTR,
        Error::TaskTerminating => EBUSY,
        Error::NoSuchThread(_) => ESRCH,
    }
}

/// `usec == 0` means no timeout.
fn timeout_from_usec(usec: usize) -> Option<Duration> {
    (usec != 0).then(|| Duration::from_micros(usec as u64))
}

impl Kernel {
    /// Decode and run a system call.
    pub fn syscall_dispatch(&self, id: usize, args: [usize; 4]) -> isize {
        let syscall = match Syscall::try_from(id) {
            Ok(syscall) => syscall,
            Err(err) => {
                log::warn!("unknown system call {}", id);
                return errno(err);
            }
        };
        match syscall {
            Syscall::ThreadCreate => self.sys_thread_create(UspaceArg {
                entry: args[0],
                stack: args[1],
                arg: args[2],
            }),
            Syscall::ThreadExit => self.sys_thread_exit(args[0] as i32),
            Syscall::TaskGetId => self.sys_task_get_id(),
            Syscall::FutexSleep => self.sys_futex_sleep_timeout(args[0], args[1], args[2] as u32),
            Syscall::FutexWakeup => self.sys_futex_wakeup(args[0]),
            Syscall::PreemptControl => self.sys_preempt_control(args[0] != 0),
            Syscall::ThreadJoin => self.sys_thread_join(args[0] as ThreadId, args[1]),
        }
    }

    /// Start a userspace thread in the caller's task. Returns its id.
    pub fn sys_thread_create(&self, uarg: UspaceArg) -> isize {
        let Some(current) = self.current_thread() else {
            return EINVAL;
        };
        let machine = self.machine_arc();
        let body = move || machine.enter_uspace(&uarg);
        match self.thread_create(body, current.task(), ThreadFlags::empty(), "uinit") {
            Ok(thread) => {
                self.thread_ready(&thread);
                thread.id() as isize
            }
            Err(err) => errno(err),
        }
    }

    /// Terminate the calling userspace thread.
    pub fn sys_thread_exit(&self, status: i32) -> ! {
        if let Some(current) = self.current_thread() {
            log::debug!("thread {} exits with status {}", current.id(), status);
        }
        self.thread_exit()
    }

    /// Wait for a thread of the caller's task and reclaim it.
    pub fn sys_thread_join(&self, tid: ThreadId, usec: usize) -> isize {
        let Some(thread) = self.thread_find(tid) else {
            return errno(Error::NoSuchThread(tid));
        };
        if let Some(current) = self.current_thread() {
            if current.task().id() != thread.task().id() {
                return errno(Error::NoSuchThread(tid));
            }
        }
        match self
            .thread_join(&thread, timeout_from_usec(usec))
            .and_then(|()| self.thread_detach(&thread))
        {
            Ok(()) => EOK,
            Err(err) => errno(err),
        }
    }

    pub fn sys_task_get_id(&self) -> isize {
        match self.current_thread() {
            Some(thread) => thread.task().id() as isize,
            None => EINVAL,
        }
    }

    /// Sleep on a futex. Returns an `ESYNCH_*` code, or `ENOENT` when
    /// `uaddr` is not backed by memory.
    pub fn sys_futex_sleep_timeout(&self, uaddr: VirtAddr, usec: usize, flags: u32) -> isize {
        let flags = SynchFlags::from_bits_truncate(flags);
        match self.futex_sleep(uaddr, timeout_from_usec(usec), flags) {
            Ok(rc) => sleep_status(rc),
            Err(err) => errno(err),
        }
    }

    pub fn sys_futex_wakeup(&self, uaddr: VirtAddr) -> isize {
        match self.futex_wakeup(uaddr) {
            Ok(()) => EOK,
            Err(err) => errno(err),
        }
    }

    pub fn sys_preempt_control(&self, enable: bool) -> isize {
        if enable {
            self.preemption_enable();
        } else {
            self.preemption_disable();
        }
        EOK
    }
}

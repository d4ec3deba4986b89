//! NOS concurrency core
//!
//! Thread lifecycle, the wait queue every sleeping primitive is built on,
//! per-CPU timeouts driven by the clock tick, physical-address keyed
//! futexes and the sleeping locks (semaphore, mutex, condition variable,
//! read-write lock).
//!
//! The crate does not own the hardware. Context switching, interrupt
//! control and per-CPU identity come from a [`Machine`] implementation
//! supplied at boot; address translation comes from the task's
//! [`AddressSpace`](nos_api::AddressSpace).
//!
//! # Lock ordering
//!
//! Blocking acquisitions always follow
//! `rwlock state -> wait queue -> thread -> run queue / timeout list`, and
//! `futex table -> task futex index`. The paths that start from a thread
//! and need the queue it sleeps in (timeout expiry, interruption, exit
//! waking its joiners) only ever *try* the queue lock and start over after
//! releasing the thread lock when the attempt fails.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod kernel;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod time;

pub use arch::{IrqGuard, Ipl, Machine, UspaceArg};
pub use config::KernelConfig;
pub use kernel::Kernel;
pub use process::task::Task;
pub use process::thread::{Thread, ThreadFlags, ThreadGuard, ThreadInfo, ThreadState};
pub use sync::condvar::Condvar;
pub use sync::futex::{Futex, FutexTable};
pub use sync::mutex::{Mutex, MutexGuard};
pub use sync::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use sync::semaphore::Semaphore;
pub use sync::synch::{SleepResult, SynchFlags};
pub use sync::waitq::{SleepGuard, WaitQueue, WakeMode};
pub use time::timeout::{TimeoutHandle, TimeoutHandler};

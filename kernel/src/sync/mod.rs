//! Sleeping synchronization.
//!
//! Everything here is built on [`waitq::WaitQueue`]: a semaphore banks its
//! count as missed wakeups, a mutex is a semaphore of one, a condition
//! variable is a bare wait queue, a read-write lock is a reader count in
//! front of a mutex, and a futex is a wait queue found by physical address.

pub mod condvar;
pub mod futex;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod synch;
pub mod waitq;

//! Kernel backend of userspace futexes.
//!
//! A futex is keyed by the physical address of the user's lock word, so
//! tasks mapping the same page at different virtual addresses share it.
//! The global table maps addresses to futexes; every task additionally
//! remembers the futexes it has used. Each task that knows a futex holds
//! one reference on it, dropped when the task is destroyed.
//!
//! Lookups vastly outnumber insertions, so the table is a reader-writer
//! lock. A task index is always locked after the table.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use hashbrown::HashMap;
use nos_api::{Error, PhysAddr, Result, VirtAddr};
use spin::RwLock;

use crate::kernel::Kernel;
use crate::process::task::Task;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::{WaitQueue, WakeMode};

/// Kernel side of one futex.
pub struct Futex {
    paddr: PhysAddr,
    wq: WaitQueue,
    /// Tasks referencing the futex; only changed with the table write-locked
    refcount: AtomicUsize,
}

impl Futex {
    fn new(paddr: PhysAddr) -> Self {
        Self {
            paddr,
            wq: WaitQueue::new(),
            refcount: AtomicUsize::new(1),
        }
    }

    /// Physical address of the lock word
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }

    /// Tasks referencing the futex
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Futex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Futex")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("refcount", &self.refcount())
            .field("wq", &self.wq)
            .finish()
    }
}

/// Global physical address -> futex table.
pub struct FutexTable {
    table: RwLock<HashMap<PhysAddr, Arc<Futex>>>,
    capacity: usize,
}

impl FutexTable {
    /// Table holding at most `capacity` futexes
    pub fn new(capacity: usize) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live futexes
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Futex at `paddr`, without creating or referencing it.
    pub fn lookup(&self, paddr: PhysAddr) -> Option<Arc<Futex>> {
        self.table.read().get(&paddr).cloned()
    }

    /// Futex at `paddr`, created if needed and referenced by `task`.
    pub fn find_or_create(&self, task: &Task, paddr: PhysAddr) -> Result<Arc<Futex>> {
        {
            let table = self.table.read();
            if let Some(futex) = table.get(&paddr) {
                if task.futexes.lock().contains_key(&paddr) {
                    return Ok(futex.clone());
                }
            }
        }

        // Read lock fully released; search again, the key may have been
        // inserted or freed in between.
        let mut table = self.table.write();
        if let Some(futex) = table.get(&paddr).cloned() {
            let mut index = task.futexes.lock();
            if !index.contains_key(&paddr) {
                futex.refcount.fetch_add(1, Ordering::AcqRel);
                index.insert(paddr, futex.clone());
            }
            return Ok(futex);
        }

        if table.len() >= self.capacity {
            log::warn!("futex pool exhausted, {:#x} not registered", paddr);
            return Err(Error::OutOfMemory);
        }
        let futex = Arc::new(Futex::new(paddr));
        table.insert(paddr, futex.clone());
        task.futexes.lock().insert(paddr, futex.clone());
        log::debug!("futex {:#x} created by task {}", paddr, task.id());
        Ok(futex)
    }

    /// Drop every futex reference `task` holds, freeing futexes no other
    /// task knows. Returns how many were freed.
    pub fn cleanup(&self, task: &Task) -> usize {
        let mut table = self.table.write();
        let mut index = task.futexes.lock();
        let mut freed = 0;
        for (paddr, futex) in index.drain() {
            let prev = futex.refcount.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                log::error!("futex {:#x} released more often than referenced", paddr);
                panic!("futex refcount underflow");
            }
            if prev == 1 {
                table.remove(&paddr);
                freed += 1;
                log::debug!("futex {:#x} destroyed", paddr);
            }
        }
        freed
    }

    /// Forget every futex. Only for shutdown.
    pub(crate) fn clear(&self) -> usize {
        let mut table = self.table.write();
        let n = table.len();
        table.clear();
        n
    }
}

impl Kernel {
    /// Sleep on the futex behind `uaddr` in the calling thread's task.
    /// Futex sleeps are always interruptible.
    pub fn futex_sleep(&self, uaddr: VirtAddr, timeout: Option<Duration>, flags: SynchFlags) -> Result<SleepResult> {
        let futex = self.futex_resolve(uaddr)?;
        Ok(futex.wq.sleep(self, timeout, flags | SynchFlags::INTERRUPTIBLE))
    }

    /// Wake one sleeper of the futex behind `uaddr`, or bank the wakeup.
    pub fn futex_wakeup(&self, uaddr: VirtAddr) -> Result<()> {
        let futex = self.futex_resolve(uaddr)?;
        futex.wq.wakeup(self, WakeMode::First);
        Ok(())
    }

    /// Global futex table
    pub fn futexes(&self) -> &FutexTable {
        &self.futexes
    }

    fn futex_resolve(&self, uaddr: VirtAddr) -> Result<Arc<Futex>> {
        let thread = self.current_thread().ok_or(Error::InvalidState("futex use outside thread context"))?;
        let task = thread.task();
        let paddr = task.address_space().translate(uaddr)?;
        self.futexes.find_or_create(task, paddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat;

    impl nos_api::AddressSpace for Flat {
        fn translate(&self, virt: VirtAddr) -> Result<PhysAddr> {
            Ok(virt)
        }
    }

    fn task(id: u64) -> Task {
        Task::new(id, "test", Arc::new(Flat))
    }

    #[test]
    fn tasks_share_futexes_by_physical_address() {
        let table = FutexTable::new(8);
        let a = task(1);
        let b = task(2);

        let fa = table.find_or_create(&a, 0x1000).unwrap();
        let again = table.find_or_create(&a, 0x1000).unwrap();
        assert!(Arc::ptr_eq(&fa, &again));
        assert_eq!(fa.refcount(), 1);

        let fb = table.find_or_create(&b, 0x1000).unwrap();
        assert!(Arc::ptr_eq(&fa, &fb));
        assert_eq!(fa.refcount(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cleanup_frees_only_unshared_futexes() {
        let table = FutexTable::new(8);
        let a = task(1);
        let b = task(2);
        table.find_or_create(&a, 0x1000).unwrap();
        table.find_or_create(&a, 0x2000).unwrap();
        table.find_or_create(&b, 0x1000).unwrap();

        assert_eq!(table.cleanup(&a), 1);
        assert!(table.lookup(0x2000).is_none());
        let shared = table.lookup(0x1000).unwrap();
        assert_eq!(shared.refcount(), 1);
        assert_eq!(a.futex_count(), 0);

        assert_eq!(table.cleanup(&b), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let table = FutexTable::new(1);
        let a = task(1);
        table.find_or_create(&a, 0x1000).unwrap();
        assert_eq!(table.find_or_create(&a, 0x2000).unwrap_err(), Error::OutOfMemory);
        // Known futexes stay reachable.
        assert!(table.find_or_create(&a, 0x1000).is_ok());
    }
}

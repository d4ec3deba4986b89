//! Per-CPU timeout registry.
//!
//! Armed timeouts are kept in a delta list: each entry stores the ticks
//! remaining after the entry before it, so a clock tick only touches the
//! head. Handlers run with the registry lock released and may register
//! new timeouts.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use nos_api::{CpuId, Ticks};
use spin::Mutex;

use crate::kernel::Kernel;

/// Callback run when a timeout expires.
pub type TimeoutHandler = Box<dyn FnOnce(&Kernel) + Send + 'static>;

/// Proof that a timeout was registered. Consumed by unregistration, so a
/// timeout can never be cancelled twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an armed timeout can only be cancelled through its handle"]
pub struct TimeoutHandle {
    cpu: CpuId,
    id: u64,
}

impl TimeoutHandle {
    /// CPU whose registry holds the timeout
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

struct ArmedTimeout {
    id: u64,
    delta: Ticks,
    handler: TimeoutHandler,
}

#[derive(Default)]
pub(crate) struct TimeoutList {
    active: VecDeque<ArmedTimeout>,
}

impl TimeoutList {
    /// Insert keeping expiry order. Equal expiry times fire in registration order.
    fn insert(&mut self, id: u64, ticks: Ticks, handler: TimeoutHandler) {
        let mut sum = 0;
        let mut pos = self.active.len();
        for (i, armed) in self.active.iter().enumerate() {
            if sum + armed.delta > ticks {
                pos = i;
                break;
            }
            sum += armed.delta;
        }
        let delta = ticks - sum;
        if let Some(next) = self.active.get_mut(pos) {
            next.delta -= delta;
        }
        self.active.insert(pos, ArmedTimeout { id, delta, handler });
    }

    fn remove(&mut self, id: u64) -> bool {
        let Some(pos) = self.active.iter().position(|armed| armed.id == id) else {
            return false;
        };
        if let Some(removed) = self.active.remove(pos) {
            if let Some(next) = self.active.get_mut(pos) {
                next.delta += removed.delta;
            }
        }
        true
    }

    /// Account one tick against the head.
    fn advance(&mut self) {
        if let Some(head) = self.active.front_mut() {
            head.delta = head.delta.saturating_sub(1);
        }
    }

    fn pop_expired(&mut self) -> Option<(u64, TimeoutHandler)> {
        if self.active.front()?.delta != 0 {
            return None;
        }
        self.active.pop_front().map(|armed| (armed.id, armed.handler))
    }

    fn len(&self) -> usize {
        self.active.len()
    }
}

/// Timeout registry of one CPU.
///
/// Callers keep interrupts disabled while calling in, the clock tick takes
/// the same lock from interrupt context.
pub struct TimeoutQueue {
    cpu: CpuId,
    list: Mutex<TimeoutList>,
    next_id: AtomicU64,
}

impl TimeoutQueue {
    /// Empty registry for `cpu`
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            list: Mutex::new(TimeoutList::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Arm `handler` to run after `ticks` clock ticks (at least one).
    pub fn register(&self, ticks: Ticks, handler: TimeoutHandler) -> TimeoutHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticks = ticks.max(1);
        self.list.lock().insert(id, ticks, handler);
        log::trace!("timeout {} armed on cpu{} for {} ticks", id, self.cpu, ticks);
        TimeoutHandle { cpu: self.cpu, id }
    }

    /// Cancel a timeout. `false` means it already fired or is firing right
    /// now; the handler may or may not have completed.
    pub fn unregister(&self, handle: TimeoutHandle) -> bool {
        if handle.cpu != self.cpu {
            log::error!("timeout {} of cpu{} unregistered on cpu{}", handle.id, handle.cpu, self.cpu);
            panic!("timeout handle used with a foreign registry");
        }
        let removed = self.list.lock().remove(handle.id);
        log::trace!("timeout {} on cpu{} cancelled: {}", handle.id, self.cpu, removed);
        removed
    }

    /// Process one clock tick, running every handler that became due.
    /// Returns the number of handlers run.
    pub fn tick(&self, kernel: &Kernel) -> usize {
        let mut fired = 0;
        let mut list = self.list.lock();
        list.advance();
        while let Some((id, handler)) = list.pop_expired() {
            drop(list);
            log::trace!("timeout {} expired on cpu{}", id, self.cpu);
            handler(kernel);
            fired += 1;
            list = self.list.lock();
        }
        fired
    }

    /// Number of armed timeouts
    pub fn armed(&self) -> usize {
        self.list.lock().len()
    }

    /// Drop every armed timeout without running it.
    pub(crate) fn clear(&self) -> usize {
        let mut list = self.list.lock();
        let n = list.len();
        list.active.clear();
        n
    }
}

impl fmt::Debug for TimeoutQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutQueue")
            .field("cpu", &self.cpu)
            .field("armed", &self.armed())
            .finish()
    }
}

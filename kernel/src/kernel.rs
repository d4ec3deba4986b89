//! The kernel object: owner of every registry of the concurrency core.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize};

use hashbrown::HashMap;
use nos_api::{CpuId, Result, TaskId, Ticks};
use spin::Mutex;

use crate::arch::Machine;
use crate::config::KernelConfig;
use crate::cpu::Cpu;
use crate::process::task::Task;
use crate::process::thread::{Thread, ThreadRegistry};
use crate::sync::futex::FutexTable;
use crate::time::timeout::{TimeoutHandle, TimeoutHandler};

/// Concurrency core of one booted kernel.
///
/// Created once at boot by [`Kernel::new`] and torn down by
/// [`Kernel::shutdown`]. All registries (threads, tasks, futexes, per-CPU
/// timeouts and ready queues) are reached through it.
pub struct Kernel {
    machine: Arc<dyn Machine>,
    config: KernelConfig,
    cpus: Vec<Cpu>,
    pub(crate) threads: ThreadRegistry,
    pub(crate) tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    pub(crate) futexes: FutexTable,
    pub(crate) nrdy: AtomicUsize,
    pub(crate) next_task_id: AtomicU64,
}

impl Kernel {
    /// Bring the core up on `machine`.
    pub fn new(machine: Arc<dyn Machine>, config: KernelConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let cpus = (0..config.cpu_count).map(Cpu::new).collect();
        let kernel = Self {
            machine,
            cpus,
            threads: ThreadRegistry::new(config.max_threads),
            tasks: Mutex::new(HashMap::new()),
            futexes: FutexTable::new(config.max_futexes),
            nrdy: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
            config,
        };
        log::info!(
            "concurrency core up: {} cpus, {} Hz, {} threads, {} futexes",
            kernel.config.cpu_count,
            kernel.config.hz,
            kernel.config.max_threads,
            kernel.config.max_futexes
        );
        Ok(Arc::new(kernel))
    }

    /// Tear the core down. Armed timeouts are dropped without running and
    /// the futex table is emptied; no thread may sleep or run any more.
    pub fn shutdown(&self) {
        let cancelled: usize = self.cpus.iter().map(|cpu| cpu.timeouts.clear()).sum();
        let futexes = self.futexes.clear();
        log::info!(
            "concurrency core down: {} threads and {} tasks left, {} timeouts cancelled, {} futexes dropped",
            self.thread_count(),
            self.task_count(),
            cancelled,
            futexes
        );
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub(crate) fn machine_arc(&self) -> Arc<dyn Machine> {
        self.machine.clone()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, id: CpuId) -> Option<&Cpu> {
        self.cpus.get(id)
    }

    /// State of the CPU executing the caller.
    pub(crate) fn current_cpu(&self) -> &Cpu {
        let id = self.machine.cpu_id();
        match self.cpus.get(id) {
            Some(cpu) => cpu,
            None => {
                log::error!("running on cpu{} but only {} cpus configured", id, self.cpus.len());
                panic!("current cpu out of range");
            }
        }
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.machine.current_thread()
    }

    /// Current thread of an operation that only makes sense in thread context.
    pub(crate) fn expect_current(&self, what: &str) -> Arc<Thread> {
        match self.machine.current_thread() {
            Some(thread) => thread,
            None => {
                log::error!("{} called outside thread context on cpu{}", what, self.machine.cpu_id());
                panic!("no current thread");
            }
        }
    }

    /// Arm a timeout on the calling CPU. Interrupts must be disabled.
    pub fn timeout_register(&self, ticks: Ticks, handler: TimeoutHandler) -> TimeoutHandle {
        self.current_cpu().timeouts.register(ticks, handler)
    }

    /// Cancel a timeout on whatever CPU it was armed. See
    /// [`TimeoutQueue::unregister`](crate::time::timeout::TimeoutQueue::unregister).
    pub fn timeout_unregister(&self, handle: TimeoutHandle) -> bool {
        match self.cpus.get(handle.cpu()) {
            Some(cpu) => cpu.timeouts.unregister(handle),
            None => panic!("timeout handle of unknown cpu{}", handle.cpu()),
        }
    }
}

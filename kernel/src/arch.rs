//! Platform interface consumed by the concurrency core.
//!
//! The core never touches registers or stacks itself. Everything that
//! depends on the architecture or on the dispatcher goes through
//! [`Machine`].

use alloc::sync::Arc;

use nos_api::{CpuId, Result, VirtAddr};

use crate::process::thread::{Thread, ThreadGuard};

/// Saved interrupt priority level, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipl(pub usize);

/// Initial userspace register state of a thread created by a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UspaceArg {
    /// Entry point
    pub entry: VirtAddr,
    /// Top of the userspace stack
    pub stack: VirtAddr,
    /// Argument handed to the entry point
    pub arg: usize,
}

/// Architecture and dispatch services.
pub trait Machine: Send + Sync {
    /// Index of the CPU executing the caller.
    fn cpu_id(&self) -> CpuId;

    /// Thread currently running on this CPU, if any.
    fn current_thread(&self) -> Option<Arc<Thread>>;

    /// Disable interrupts, returning the previous level.
    fn interrupts_disable(&self) -> Ipl;

    /// Enable interrupts, returning the previous level.
    fn interrupts_enable(&self) -> Ipl;

    /// Restore a level returned by [`interrupts_disable`](Self::interrupts_disable)
    /// or [`interrupts_enable`](Self::interrupts_enable).
    fn interrupts_restore(&self, ipl: Ipl);

    /// Current interrupt level.
    fn interrupts_read(&self) -> Ipl;

    /// Reserve the kernel stack of `thread` and build its initial context.
    ///
    /// The first dispatch of the thread must enter
    /// [`Kernel::thread_entry`](crate::Kernel::thread_entry).
    fn prepare_context(&self, thread: &Arc<Thread>) -> Result<()>;

    /// Give back what [`prepare_context`](Self::prepare_context) reserved.
    ///
    /// May be called for a thread that is still on its way out through
    /// [`exit_context`](Self::exit_context); the stack must then be freed
    /// only once the switch has completed.
    fn release_context(&self, thread: &Thread);

    /// Save the context of `thread` (the caller) and run something else.
    ///
    /// `locked` must be released only after the context is saved, so no
    /// other CPU can resume the thread on a half-saved stack. Returns once
    /// the thread has been dispatched again.
    fn switch_away(&self, thread: &Arc<Thread>, locked: ThreadGuard<'_>);

    /// Final switch of an exited thread.
    fn exit_context(&self, thread: &Arc<Thread>) -> !;

    /// Hint that `cpu` has new ready work. Must not block.
    fn reschedule(&self, cpu: CpuId);

    /// Run the userspace part of a thread created by
    /// [`Kernel::sys_thread_create`](crate::Kernel::sys_thread_create).
    /// Returns only if userspace finishes without calling thread exit.
    fn enter_uspace(&self, uarg: &UspaceArg);
}

/// Interrupts stay disabled until the guard is dropped.
pub struct IrqGuard<'a> {
    machine: &'a dyn Machine,
    ipl: Ipl,
}

impl<'a> IrqGuard<'a> {
    /// Disable interrupts on the current CPU.
    pub fn new(machine: &'a dyn Machine) -> Self {
        let ipl = machine.interrupts_disable();
        Self { machine, ipl }
    }

    /// Level that will be restored on drop.
    pub fn saved(&self) -> Ipl {
        self.ipl
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.machine.interrupts_restore(self.ipl);
    }
}

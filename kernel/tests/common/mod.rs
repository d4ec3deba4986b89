//! Host platform for integration tests.
//!
//! Every kernel thread runs on its own std thread. A thread only makes
//! progress while it holds its permit: dispatching a thread grants the
//! permit, switching away waits for it again. Several kernel threads may
//! therefore run at the same time, which is what an SMP machine does too.
//! The clock never ticks on its own; tests call [`Harness::tick`].

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use nos_api::{AddressSpace, CpuId, Error, PhysAddr, Result, ThreadId, VirtAddr};
use nos_kcore::{Ipl, Kernel, KernelConfig, Machine, Task, Thread, ThreadFlags, ThreadGuard, ThreadState, UspaceArg};

/// How long a test waits for a kernel thread before giving up
pub const PATIENCE: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
    static CPU: Cell<CpuId> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

#[derive(Default)]
struct Permit {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Permit {
    fn grant(&self) {
        *self.granted.lock().unwrap() = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut granted = self.granted.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
        *granted = false;
    }
}

type UspaceEntry = Arc<dyn Fn(&Kernel, usize) + Send + Sync>;

/// [`Machine`] backed by std threads.
#[derive(Default)]
pub struct HostMachine {
    kernel: OnceLock<Weak<Kernel>>,
    permits: Mutex<HashMap<ThreadId, Arc<Permit>>>,
    started: Mutex<HashSet<ThreadId>>,
    uspace: Mutex<HashMap<VirtAddr, UspaceEntry>>,
    fail_prepare: AtomicBool,
    released: AtomicUsize,
}

impl HostMachine {
    fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.get().and_then(Weak::upgrade)
    }

    fn permit(&self, id: ThreadId) -> Arc<Permit> {
        self.permits.lock().unwrap().entry(id).or_default().clone()
    }

    /// Make the next `prepare_context` calls fail like an exhausted stack
    /// allocator.
    pub fn fail_contexts(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Contexts given back so far
    pub fn released_contexts(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Userspace code run by threads created with `entry`.
    pub fn register_uspace<F>(&self, entry: VirtAddr, f: F)
    where
        F: Fn(&Kernel, usize) + Send + Sync + 'static,
    {
        self.uspace.lock().unwrap().insert(entry, Arc::new(f));
    }

    fn dispatch(&self, kernel: &Arc<Kernel>, thread: Arc<Thread>, cpu: CpuId) {
        if self.started.lock().unwrap().insert(thread.id()) {
            let kernel = kernel.clone();
            let name = format!("kthread-{}-{}", thread.id(), thread.name());
            thread::Builder::new()
                .name(name)
                .spawn(move || {
                    CURRENT.with(|c| *c.borrow_mut() = Some(thread));
                    CPU.set(cpu);
                    IRQ_ENABLED.set(false);
                    kernel.thread_entry();
                })
                .expect("spawn host thread");
        } else {
            self.permit(thread.id()).grant();
        }
    }
}

impl Machine for HostMachine {
    fn cpu_id(&self) -> CpuId {
        CPU.get()
    }

    fn current_thread(&self) -> Option<Arc<Thread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    fn interrupts_disable(&self) -> Ipl {
        Ipl(IRQ_ENABLED.replace(false) as usize)
    }

    fn interrupts_enable(&self) -> Ipl {
        Ipl(IRQ_ENABLED.replace(true) as usize)
    }

    fn interrupts_restore(&self, ipl: Ipl) {
        IRQ_ENABLED.set(ipl.0 != 0);
    }

    fn interrupts_read(&self) -> Ipl {
        Ipl(IRQ_ENABLED.get() as usize)
    }

    fn prepare_context(&self, thread: &Arc<Thread>) -> Result<()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        self.permit(thread.id());
        Ok(())
    }

    fn release_context(&self, thread: &Thread) {
        self.permits.lock().unwrap().remove(&thread.id());
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn switch_away(&self, thread: &Arc<Thread>, locked: ThreadGuard<'_>) {
        let permit = self.permit(thread.id());
        drop(locked);
        if let Some(kernel) = self.kernel() {
            for cpu in 0..kernel.cpu_count() {
                self.reschedule(cpu);
            }
        }
        permit.wait();
        if let Some(cpu) = thread.cpu() {
            CPU.set(cpu);
        }
    }

    fn exit_context(&self, _thread: &Arc<Thread>) -> ! {
        // The std thread has nothing left to run; it parks until the test
        // process ends.
        loop {
            thread::park();
        }
    }

    fn reschedule(&self, cpu: CpuId) {
        let Some(kernel) = self.kernel() else {
            return;
        };
        while let Ok(Some(thread)) = kernel.find_best_thread(cpu) {
            self.dispatch(&kernel, thread, cpu);
        }
    }

    fn enter_uspace(&self, uarg: &UspaceArg) {
        let entry = self.uspace.lock().unwrap().get(&uarg.entry).cloned();
        let (Some(entry), Some(kernel)) = (entry, self.kernel()) else {
            panic!("no userspace registered at {:#x}", uarg.entry);
        };
        entry(&kernel, uarg.arg);
    }
}

/// Identity-mapped address space.
pub struct Flat;

impl AddressSpace for Flat {
    fn translate(&self, virt: VirtAddr) -> Result<PhysAddr> {
        Ok(virt)
    }
}

/// Address space mapping everything `offset` bytes above physical memory.
pub struct Shifted(pub usize);

impl AddressSpace for Shifted {
    fn translate(&self, virt: VirtAddr) -> Result<PhysAddr> {
        virt.checked_sub(self.0).ok_or(Error::NotMapped(virt))
    }
}

/// A kernel on top of [`HostMachine`].
pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub machine: Arc<HostMachine>,
    task: Arc<Task>,
}

impl Harness {
    /// `cpus` CPUs ticking at 1000 Hz, so one tick is one millisecond.
    pub fn new(cpus: usize) -> Self {
        Self::with_config(KernelConfig::default().with_cpus(cpus).with_hz(1000))
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let machine = Arc::new(HostMachine::default());
        let kernel = Kernel::new(machine.clone(), config).expect("kernel boots");
        assert!(machine.kernel.set(Arc::downgrade(&kernel)).is_ok());
        let task = kernel.task_create("harness", Arc::new(Flat));
        Self { kernel, machine, task }
    }

    /// Task the `run` helpers put their threads in
    pub fn default_task(&self) -> &Arc<Task> {
        &self.task
    }

    /// New task over an identity-mapped address space.
    pub fn task(&self, name: &str) -> Arc<Task> {
        self.kernel.task_create(name, Arc::new(Flat))
    }

    /// Create and ready a thread of `task` running `f`.
    pub fn spawn<F>(&self, task: &Arc<Task>, name: &str, f: F) -> Arc<Thread>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        self.spawn_with(task, name, ThreadFlags::empty(), f)
    }

    pub fn spawn_with<F>(&self, task: &Arc<Task>, name: &str, flags: ThreadFlags, f: F) -> Arc<Thread>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        let thread = self.create(task, name, flags, f);
        self.kernel.thread_ready(&thread);
        thread
    }

    /// Create a thread of `task` running `f` without readying it.
    pub fn create<F>(&self, task: &Arc<Task>, name: &str, flags: ThreadFlags, f: F) -> Arc<Thread>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        let kernel = Arc::downgrade(&self.kernel);
        let body = move || {
            if let Some(kernel) = kernel.upgrade() {
                f(&kernel);
            }
        };
        self.kernel
            .thread_create(body, task, flags, name)
            .expect("thread created")
    }

    /// Run `f` in a new kernel thread of the default task and hand back
    /// a receiver for its result.
    pub fn start<T, F>(&self, name: &str, f: F) -> (Arc<Thread>, mpsc::Receiver<T>)
    where
        T: Send + 'static,
        F: FnOnce(&Kernel) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let thread = self.spawn(&self.task.clone(), name, move |kernel| {
            let _ = tx.send(f(kernel));
        });
        (thread, rx)
    }

    /// Run `f` in a kernel thread and wait for its result.
    pub fn run<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&Kernel) -> T + Send + 'static,
    {
        let (_, rx) = self.start("run", f);
        recv(&rx)
    }

    /// One clock tick on every CPU.
    pub fn tick(&self) {
        let here = CPU.get();
        for cpu in 0..self.kernel.cpu_count() {
            CPU.set(cpu);
            self.kernel.clock();
        }
        CPU.set(here);
    }

    /// Run `f` on the test thread as if it executed on `cpu`.
    pub fn on_cpu<T>(&self, cpu: CpuId, f: impl FnOnce(&Kernel) -> T) -> T {
        let here = CPU.replace(cpu);
        let out = f(&self.kernel);
        CPU.set(here);
        out
    }

    pub fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Wait until `thread` is parked in a wait queue.
    pub fn wait_sleeping(&self, thread: &Arc<Thread>) {
        wait_until("thread to fall asleep", || thread.state() == ThreadState::Sleeping);
    }

    /// Wait until `thread` has finished its body.
    pub fn wait_dead(&self, thread: &Arc<Thread>) {
        wait_until("thread to exit", || {
            thread.is_reclaimed() || matches!(thread.state(), ThreadState::Undead)
        });
    }
}

/// Poll `cond` until it holds, failing the test after [`PATIENCE`].
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Receive a kernel thread's result, failing the test after [`PATIENCE`].
pub fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(PATIENCE).expect("kernel thread finished")
}

/// Assert that no result arrives for a short while.
pub fn assert_pending<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>) {
    match rx.recv_timeout(Duration::from_millis(50)) {
        Err(mpsc::RecvTimeoutError::Timeout) => {}
        other => panic!("kernel thread finished early: {:?}", other),
    }
}

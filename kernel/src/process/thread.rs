//! Thread management
//!
//! Thread objects, their state machine and the create / exit / join /
//! detach lifecycle. Scheduling decisions live in [`crate::sched`], the
//! sleeping machinery in [`crate::sync::waitq`].

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use bitflags::bitflags;
use hashbrown::HashMap;
use nos_api::{CpuId, Error, Result, TaskId, ThreadId, Ticks};
use spin::{Mutex, MutexGuard};

use crate::arch::IrqGuard;
use crate::kernel::Kernel;
use crate::process::task::Task;
use crate::sync::synch::{SleepResult, SynchFlags};
use crate::sync::waitq::{WaitQueue, WaitQueueInner, WakeMode};
use crate::time::timeout::TimeoutHandle;

// ============================================================================
// Constants and Types
// ============================================================================

bitflags! {
    /// Creation flags of a thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u32 {
        /// Always readied onto the CPU the thread last ran on
        const WIRED = 1 << 0;
    }
}

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never run
    Entering,
    /// Waiting in a ready queue
    Ready,
    /// Running on a CPU
    Running,
    /// Parked in a wait queue
    Sleeping,
    /// Finished its body, on the way out
    Exiting,
    /// Exited and waiting to be detached
    Undead,
}

/// Role of a thread in the read-write lock it is acquiring or holding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockHolder {
    /// Not involved with a read-write lock
    None,
    /// Shared access
    Reader,
    /// Exclusive access
    Writer,
}

/// Who took a sleeping thread off its wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Woken,
    TimedOut,
    Interrupted,
}

/// Body run by a new thread
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Mutable thread state, protected by the thread lock.
pub struct ThreadInner {
    pub(crate) state: ThreadState,
    /// Ready queue level of the last readying, `None` before the first one
    pub(crate) priority: Option<usize>,
    /// Remaining time slice
    pub(crate) ticks: Ticks,
    pub(crate) cpu: Option<CpuId>,

    /// Wait queue the thread sleeps in
    pub(crate) sleep_queue: Option<Weak<WaitQueueInner>>,
    pub(crate) sleep_interruptible: bool,
    pub(crate) sleep_timeout: Option<TimeoutHandle>,
    /// A timeout of this thread may still be running its handler
    pub(crate) timeout_pending: bool,
    pub(crate) wake_reason: Option<WakeReason>,

    /// Sticky kill request, checked at the start of interruptible sleeps
    pub(crate) interrupted: bool,
    pub(crate) detached: bool,
    pub(crate) join_pending: bool,
    pub(crate) joined: bool,
    pub(crate) reclaimed: bool,
    pub(crate) rwlock_holder: RwLockHolder,
}

impl ThreadInner {
    fn new() -> Self {
        Self {
            state: ThreadState::Entering,
            priority: None,
            ticks: 0,
            cpu: None,
            sleep_queue: None,
            sleep_interruptible: false,
            sleep_timeout: None,
            timeout_pending: false,
            wake_reason: None,
            interrupted: false,
            detached: false,
            join_pending: false,
            joined: false,
            reclaimed: false,
            rwlock_holder: RwLockHolder::None,
        }
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// CPU the thread is queued on or last ran on
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }
}

/// Locked thread state
pub type ThreadGuard<'a> = MutexGuard<'a, ThreadInner>;

/// Thread control block
pub struct Thread {
    id: ThreadId,
    name: String,
    task: Arc<Task>,
    flags: ThreadFlags,
    inner: Mutex<ThreadInner>,
    pub(crate) join_wq: WaitQueue,
    body: Mutex<Option<ThreadBody>>,
    preempt_disabled: AtomicUsize,
}

impl Thread {
    fn new(id: ThreadId, name: &str, task: Arc<Task>, flags: ThreadFlags, body: ThreadBody) -> Self {
        Self {
            id,
            name: name.to_string(),
            task,
            flags,
            inner: Mutex::new(ThreadInner::new()),
            join_wq: WaitQueue::new(),
            body: Mutex::new(Some(body)),
            preempt_disabled: AtomicUsize::new(0),
        }
    }

    /// Thread id, unique for the lifetime of the kernel
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Creation flags
    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// Take the thread lock. Interrupts should be disabled by the caller.
    pub fn lock(&self) -> ThreadGuard<'_> {
        self.inner.lock()
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    /// CPU the thread is queued on or last ran on
    pub fn cpu(&self) -> Option<CpuId> {
        self.inner.lock().cpu
    }

    /// Ready queue level of the last readying
    pub fn priority(&self) -> Option<usize> {
        self.inner.lock().priority
    }

    /// Whether the kill flag is set
    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().interrupted
    }

    /// Whether the thread has been torn down
    pub fn is_reclaimed(&self) -> bool {
        self.inner.lock().reclaimed
    }

    /// Whether the clock may preempt this thread
    pub fn preemption_disabled(&self) -> bool {
        self.preempt_disabled.load(Ordering::Acquire) > 0
    }

    fn info(&self) -> ThreadInfo {
        let t = self.inner.lock();
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            task: self.task.id(),
            state: t.state,
            cpu: t.cpu,
            priority: t.priority,
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task", &self.task.id())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Snapshot of one thread for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub task: TaskId,
    pub state: ThreadState,
    pub cpu: Option<CpuId>,
    pub priority: Option<usize>,
}

// ============================================================================
// Thread registry
// ============================================================================

/// Every live thread, keyed by id. Bounded like the object pool it stands
/// for: `live` counts reserved slots, including threads still being set up.
pub(crate) struct ThreadRegistry {
    map: Mutex<HashMap<ThreadId, Arc<Thread>>>,
    last_tid: AtomicU64,
    live: AtomicUsize,
    capacity: usize,
}

impl ThreadRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            last_tid: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            capacity,
        }
    }

    fn reserve(&self) -> Result<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory)
    }

    fn unreserve(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 0 {
            panic!("thread pool released more slots than it handed out");
        }
    }

    fn next_id(&self) -> ThreadId {
        self.last_tid.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn insert(&self, thread: Arc<Thread>) {
        self.map.lock().insert(thread.id(), thread);
    }

    fn remove(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.map.lock().remove(&id)
    }

    pub(crate) fn lookup(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.map.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<Thread>> {
        let mut threads: Vec<_> = self.map.lock().values().cloned().collect();
        threads.sort_by_key(|t| t.id());
        threads
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Kernel {
    /// Create a thread of `task` running `body`.
    ///
    /// The thread is left in [`ThreadState::Entering`]; hand it to
    /// [`thread_ready`](Self::thread_ready) to start it.
    pub fn thread_create<F>(&self, body: F, task: &Arc<Task>, flags: ThreadFlags, name: &str) -> Result<Arc<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !task.accepts_new_threads() {
            log::warn!("task {} is terminating, thread '{}' not created", task.id(), name);
            return Err(Error::TaskTerminating);
        }
        self.threads.reserve().inspect_err(|_| {
            log::warn!("thread pool exhausted, thread '{}' not created", name);
        })?;

        let id = self.threads.next_id();
        let thread = Arc::new(Thread::new(id, name, task.clone(), flags, Box::new(body)));

        if let Err(err) = self.machine().prepare_context(&thread) {
            self.threads.unreserve();
            return Err(err);
        }
        // Every id a task lists must resolve in the registry.
        self.threads.insert(thread.clone());
        if let Err(err) = task.attach_thread(id) {
            self.threads.remove(id);
            self.machine().release_context(&thread);
            self.threads.unreserve();
            return Err(err);
        }

        log::debug!("thread {} '{}' created in task {}", id, name, task.id());
        Ok(thread)
    }

    /// First code run by a new thread: its body, then exit.
    pub fn thread_entry(&self) -> ! {
        let thread = self.expect_current("thread_entry");
        let Some(body) = thread.body.lock().take() else {
            log::error!("thread {} entered twice", thread.id());
            panic!("thread_entry: body already consumed");
        };
        self.machine().interrupts_enable();
        body();
        self.thread_exit()
    }

    /// Terminate the calling thread.
    pub fn thread_exit(&self) -> ! {
        let thread = self.expect_current("thread_exit");

        // Interrupts stay disabled from here until the final switch.
        let mut t = loop {
            let ipl = self.machine().interrupts_disable();
            let t = thread.lock();
            if !t.timeout_pending {
                break t;
            }
            // A timeout handler of our last sleep is still running.
            drop(t);
            self.machine().interrupts_restore(ipl);
            core::hint::spin_loop();
        };
        t.state = ThreadState::Exiting;
        log::debug!("thread {} '{}' exiting", thread.id(), thread.name());

        loop {
            if t.detached {
                self.thread_destroy(&thread, &mut t);
                break;
            }
            let Some(mut joiners) = thread.join_wq.try_lock_list() else {
                drop(t);
                core::hint::spin_loop();
                t = thread.lock();
                continue;
            };
            t.state = ThreadState::Undead;
            WaitQueue::wakeup_locked(self, &mut joiners, WakeMode::First);
            break;
        }
        drop(t);
        self.machine().exit_context(&thread)
    }

    /// Wait for `thread` to exit.
    ///
    /// Joining a thread that is already undead succeeds at once. The joined
    /// thread still has to be detached to be reclaimed.
    pub fn thread_join(&self, thread: &Arc<Thread>, timeout: Option<Duration>) -> Result<()> {
        if let Some(current) = self.current_thread() {
            if Arc::ptr_eq(&current, thread) {
                return Err(Error::WouldDeadlock);
            }
        }
        {
            let _irq = IrqGuard::new(self.machine());
            let mut t = thread.lock();
            if t.detached {
                return Err(Error::InvalidState("thread is detached"));
            }
            if t.joined || t.join_pending {
                return Err(Error::InvalidState("thread is already joined"));
            }
            t.join_pending = true;
        }

        let rc = thread.join_wq.sleep(self, timeout, SynchFlags::INTERRUPTIBLE);

        let _irq = IrqGuard::new(self.machine());
        let mut t = thread.lock();
        t.join_pending = false;
        t.joined = rc.succeeded();
        rc.into_result()
    }

    /// Let `thread` be reclaimed as soon as it is undead, or right now if
    /// it already is.
    pub fn thread_detach(&self, thread: &Arc<Thread>) -> Result<()> {
        let _irq = IrqGuard::new(self.machine());
        let mut t = thread.lock();
        if t.detached {
            return Err(Error::InvalidState("thread is already detached"));
        }
        if t.join_pending {
            return Err(Error::InvalidState("thread has a pending joiner"));
        }
        t.detached = true;
        if t.state == ThreadState::Undead {
            self.thread_destroy(thread, &mut t);
        }
        Ok(())
    }

    /// Release everything `thread` holds. Called with the thread lock held.
    fn thread_destroy(&self, thread: &Arc<Thread>, t: &mut ThreadInner) {
        if t.reclaimed || !matches!(t.state, ThreadState::Exiting | ThreadState::Undead) {
            log::error!(
                "thread {} destroyed in state {:?} (reclaimed: {})",
                thread.id(),
                t.state,
                t.reclaimed
            );
            panic!("thread_destroy: thread is not dead or already freed");
        }
        if t.sleep_queue.is_some() {
            log::error!("thread {} destroyed while linked into a wait queue", thread.id());
            panic!("thread_destroy: thread still sleeping");
        }
        t.reclaimed = true;

        self.machine().release_context(thread);
        if self.threads.remove(thread.id()).is_none() {
            panic!("thread_destroy: thread {} missing from the registry", thread.id());
        }
        self.threads.unreserve();
        log::debug!("thread {} '{}' destroyed", thread.id(), thread.name());

        if thread.task().detach_thread(thread.id()) {
            self.task_destroy(thread.task());
        }
    }

    /// Sleep the calling thread for `duration`.
    pub fn thread_sleep(&self, duration: Duration) -> SleepResult {
        let wq = WaitQueue::new();
        wq.sleep(self, Some(duration), SynchFlags::NON_BLOCKING)
    }

    /// Wake `thread` if it sleeps interruptibly. Returns whether it did.
    pub fn thread_interrupt(&self, thread: &Arc<Thread>) -> bool {
        WaitQueue::interrupt(self, thread)
    }

    /// Look a thread up by id.
    pub fn thread_find(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lookup(id)
    }

    /// Number of threads not yet reclaimed
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Snapshot of every thread, ordered by id.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.snapshot().iter().map(|t| t.info()).collect()
    }

    /// Log one line per thread.
    pub fn thread_print_list(&self) {
        let threads = self.threads();
        log::info!("{} threads", threads.len());
        for info in threads {
            log::info!(
                "tid={} name='{}' task={} state={:?} cpu={:?} prio={:?}",
                info.id,
                info.name,
                info.task,
                info.state,
                info.cpu,
                info.priority
            );
        }
    }

    /// Keep the clock from preempting the calling thread. Nests.
    pub fn preemption_disable(&self) {
        if let Some(thread) = self.current_thread() {
            thread.preempt_disabled.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Undo one [`preemption_disable`](Self::preemption_disable).
    pub fn preemption_enable(&self) {
        if let Some(thread) = self.current_thread() {
            let prev = thread.preempt_disabled.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                log::error!("thread {} enabled preemption more often than it disabled it", thread.id());
                panic!("preemption_enable: unbalanced call");
            }
        }
    }
}

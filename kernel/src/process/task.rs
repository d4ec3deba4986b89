//! Tasks: the owners of threads, address spaces and futex references.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;

use hashbrown::HashMap;
use nos_api::{AddressSpace, Error, PhysAddr, Result, TaskId, ThreadId};
use spin::Mutex;

use crate::arch::IrqGuard;
use crate::kernel::Kernel;
use crate::sync::futex::Futex;

struct Members {
    threads: Vec<ThreadId>,
    refcount: usize,
    accept_new_threads: bool,
    main_thread: Option<ThreadId>,
}

/// A task
pub struct Task {
    id: TaskId,
    name: String,
    address_space: Arc<dyn AddressSpace>,
    members: Mutex<Members>,
    /// Futexes this task has used, keyed like the global table.
    /// Always locked after the global futex table.
    pub(crate) futexes: Mutex<HashMap<PhysAddr, Arc<Futex>>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, name: &str, address_space: Arc<dyn AddressSpace>) -> Self {
        Self {
            id,
            name: name.to_string(),
            address_space,
            members: Mutex::new(Members {
                threads: Vec::new(),
                refcount: 0,
                accept_new_threads: true,
                main_thread: None,
            }),
            futexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.address_space
    }

    /// Threads attached and not yet destroyed
    pub fn thread_count(&self) -> usize {
        self.members.lock().refcount
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.members.lock().threads.clone()
    }

    /// First thread ever attached
    pub fn main_thread(&self) -> Option<ThreadId> {
        self.members.lock().main_thread
    }

    pub fn accepts_new_threads(&self) -> bool {
        self.members.lock().accept_new_threads
    }

    /// Number of futexes this task references
    pub fn futex_count(&self) -> usize {
        self.futexes.lock().len()
    }

    pub(crate) fn stop_accepting(&self) {
        self.members.lock().accept_new_threads = false;
    }

    pub(crate) fn attach_thread(&self, tid: ThreadId) -> Result<()> {
        let mut m = self.members.lock();
        if !m.accept_new_threads {
            return Err(Error::TaskTerminating);
        }
        m.threads.push(tid);
        m.refcount += 1;
        if m.main_thread.is_none() {
            m.main_thread = Some(tid);
        }
        Ok(())
    }

    /// Drop a thread reference. Returns true when it was the last one; the
    /// task then stops accepting threads and must be destroyed.
    pub(crate) fn detach_thread(&self, tid: ThreadId) -> bool {
        let mut m = self.members.lock();
        let Some(pos) = m.threads.iter().position(|t| *t == tid) else {
            log::error!("thread {} detached from task {} it never joined", tid, self.id);
            panic!("detach_thread: unknown thread");
        };
        m.threads.swap_remove(pos);
        m.refcount = match m.refcount.checked_sub(1) {
            Some(n) => n,
            None => panic!("detach_thread: task {} refcount underflow", self.id),
        };
        if m.refcount == 0 {
            m.accept_new_threads = false;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .finish()
    }
}

impl Kernel {
    /// Create an empty task running in `address_space`.
    pub fn task_create(&self, name: &str, address_space: Arc<dyn AddressSpace>) -> Arc<Task> {
        let id = self.next_task_id.fetch_add(1, Ordering::AcqRel) + 1;
        let task = Arc::new(Task::new(id, name, address_space));
        self.tasks.lock().insert(id, task.clone());
        log::debug!("task {} '{}' created", id, name);
        task
    }

    /// Look a task up by id.
    pub fn task_find(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop `task` from growing and interrupt every one of its threads.
    ///
    /// Threads sleeping interruptibly are woken with `Interrupted`; the
    /// others see the request at their next interruptible sleep.
    pub fn task_kill(&self, task: &Arc<Task>) {
        task.stop_accepting();
        let mut interrupted = 0;
        for tid in task.thread_ids() {
            let Some(thread) = self.thread_find(tid) else {
                continue;
            };
            {
                let _irq = IrqGuard::new(self.machine());
                thread.lock().interrupted = true;
            }
            if self.thread_interrupt(&thread) {
                interrupted += 1;
            }
        }
        log::debug!("task {} killed, {} sleepers interrupted", task.id(), interrupted);
    }

    /// Last thread of `task` is gone.
    pub(crate) fn task_destroy(&self, task: &Task) {
        let freed = self.futexes.cleanup(task);
        self.tasks.lock().remove(&task.id());
        log::debug!("task {} '{}' destroyed, {} futexes freed", task.id(), task.name(), freed);
    }
}

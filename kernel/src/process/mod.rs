//! Threads and the tasks that own them.

pub mod task;
pub mod thread;

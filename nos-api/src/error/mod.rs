//! Error handling module for NOS operating system

use core::fmt;

use crate::core::types::{ThreadId, VirtAddr};

/// Common error type used throughout NOS operating system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out of memory (object pool or stack exhausted)
    OutOfMemory,
    /// Virtual address has no mapping in the current address space
    NotMapped(VirtAddr),
    /// Virtual address is mapped but the page is not present
    NotPresent(VirtAddr),
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Invalid state
    InvalidState(&'static str),
    /// The operation would wait on the caller itself
    WouldDeadlock,
    /// A non-blocking operation could not complete immediately
    WouldBlock,
    /// Timeout
    TimedOut,
    /// A sleep was interrupted
    Interrupted,
    /// The owning task no longer accepts new threads
    TaskTerminating,
    /// No thread with the given identifier is registered
    NoSuchThread(ThreadId),
    /// Configuration error
    ConfigError(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::NotMapped(va) => write!(f, "Address {:#x} not mapped", va),
            Error::NotPresent(va) => write!(f, "Address {:#x} not present", va),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::WouldDeadlock => write!(f, "Operation would deadlock"),
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::TimedOut => write!(f, "Timeout"),
            Error::Interrupted => write!(f, "Interrupted"),
            Error::TaskTerminating => write!(f, "Task is terminating"),
            Error::NoSuchThread(tid) => write!(f, "No such thread: {}", tid),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error {
    /// Whether the error is a timing outcome rather than a failure
    pub fn is_timing(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::TimedOut | Error::Interrupted)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

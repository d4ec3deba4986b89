//! Flags and outcomes shared by every sleeping primitive.

use bitflags::bitflags;
use nos_api::{Error, Result};

bitflags! {
    /// How a sleep may end besides a wakeup
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SynchFlags: u32 {
        /// Fail with `WouldBlock` instead of blocking without a timeout
        const NON_BLOCKING = 1 << 0;
        /// The sleep may be cut short by an interrupt request
        const INTERRUPTIBLE = 1 << 1;
    }
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SleepResult {
    /// Non-blocking sleep with nothing to consume
    WouldBlock,
    /// A banked wakeup was consumed without blocking
    OkAtomic,
    /// Blocked and was woken
    OkBlocked,
    /// Blocked until the timeout expired
    Timeout,
    /// Blocked until interrupted
    Interrupted,
}

impl SleepResult {
    /// The sleep consumed a wakeup.
    pub fn succeeded(self) -> bool {
        matches!(self, SleepResult::OkAtomic | SleepResult::OkBlocked)
    }

    /// The sleep ended without a wakeup.
    pub fn failed(self) -> bool {
        !self.succeeded()
    }

    /// `Ok` for a consumed wakeup, the matching timing error otherwise.
    pub fn into_result(self) -> Result<()> {
        match self {
            SleepResult::OkAtomic | SleepResult::OkBlocked => Ok(()),
            SleepResult::WouldBlock => Err(Error::WouldBlock),
            SleepResult::Timeout => Err(Error::TimedOut),
            SleepResult::Interrupted => Err(Error::Interrupted),
        }
    }
}

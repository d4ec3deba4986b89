//! Memory management interface

use crate::core::types::{PhysAddr, VirtAddr};
use crate::error::Result;

/// Address space of a task, as seen by kernel services that need to
/// resolve user addresses.
///
/// Implementations take whatever page-table lock they need internally;
/// callers may hold spin locks but never sleep while translating.
pub trait AddressSpace: Send + Sync {
    /// Returns the physical address backing `virt`.
    ///
    /// Fails with [`Error::NotMapped`](crate::Error::NotMapped) when no
    /// mapping exists and [`Error::NotPresent`](crate::Error::NotPresent)
    /// when the mapping exists but the page is not resident.
    fn translate(&self, virt: VirtAddr) -> Result<PhysAddr>;
}

//! Core types used throughout NOS operating system

/// Physical address type
pub type PhysAddr = usize;

/// Virtual address type
pub type VirtAddr = usize;

/// Thread identifier type. Identifiers are never reused.
pub type ThreadId = u64;

/// Task identifier type
pub type TaskId = u64;

/// Logical CPU index
pub type CpuId = usize;

/// Clock ticks
pub type Ticks = u64;

/// Page size used for address arithmetic
pub const PAGE_SIZE: usize = 4096;

/// Round `addr` down to the start of its page
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

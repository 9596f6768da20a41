//! Seams between the table engine and the rest of the kernel.

use core::fmt;

use crate::addr::PhysAddr;

/// Source of 4 KiB frames for intermediate table nodes. The walker zeroes
/// a node before linking it, so implementations need not.
pub trait TableAlloc {
    fn allocate_table(&mut self) -> Option<PhysAddr>;
    fn free_table(&mut self, table: PhysAddr);
}

/// Why a walk stopped short of a leaf slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[must_use = "walk errors describe missing translations and must be handled"]
pub enum WalkError {
    /// An intermediate level was absent and creation was not requested.
    NotMapped,
    /// A block descriptor covers the address; there is no leaf slot.
    BlockMapped,
    /// The table allocator ran dry while creating intermediate levels.
    AllocationFailed,
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkError::NotMapped => write!(f, "address not mapped"),
            WalkError::BlockMapped => write!(f, "address covered by a block mapping"),
            WalkError::AllocationFailed => write!(f, "table allocation failed"),
        }
    }
}

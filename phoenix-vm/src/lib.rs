//! Virtual-memory management: address spaces, copy-on-write duplication,
//! frame reference counting and cross-core TLB shootdown.
//!
//! The crate owns no physical memory. Frames come and go through the
//! [`FrameProvider`] seam, and the frame reference counter is the single
//! authority on when a mapped frame returns to its provider. IPIs likewise
//! cross a seam ([`shootdown::IpiSender`]) so the whole crate runs under a
//! host test harness with mock hardware.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod addr_space;
pub mod asid;
pub mod fault;
pub mod frames;
pub mod layout;
pub mod refcount;
pub mod shootdown;

#[cfg(test)]
pub(crate) mod test_support;

pub use addr_space::{init_kernel, kernel_space, AddressSpace};
pub use fault::{FaultSink, FaultState, FatalReason};
pub use frames::FrameProvider;
pub use refcount::RefTableConfig;

use core::fmt;

/// Failures of the mapping and duplication operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[must_use = "mapping failures leave the request unfulfilled and must be handled"]
pub enum VmError {
    /// The frame provider could not satisfy an allocation.
    AllocationFailure,
    /// The address range is not mapped.
    NotMapped,
    /// A block mapping covers the range; page-granularity edits are
    /// not possible there.
    BlockMapped,
    /// Address or length not page-aligned.
    Misaligned,
    /// Address outside the half this operation may touch.
    OutOfRange,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AllocationFailure => write!(f, "out of physical frames"),
            VmError::NotMapped => write!(f, "range not mapped"),
            VmError::BlockMapped => write!(f, "range covered by a block mapping"),
            VmError::Misaligned => write!(f, "address or length not page-aligned"),
            VmError::OutOfRange => write!(f, "address outside the reachable half"),
        }
    }
}

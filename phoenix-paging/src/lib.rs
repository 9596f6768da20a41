//! Four-level AArch64 page tables with 4 KiB granules.
//!
//! This crate knows the descriptor encoding and how to walk and mutate a
//! table tree. It allocates nothing itself: callers supply a [`TableAlloc`]
//! for intermediate nodes, and leaf frames are always installed explicitly
//! by the layer above. Physical memory is reached through a single global
//! linear-map offset, configured once at boot; until it is configured the
//! offset is zero, which doubles as an identity map for host-side tests.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod entry;
pub mod prot;
pub mod table;
pub mod traits;
pub mod walk;

pub use addr::{PhysAddr, VirtAddr};
pub use entry::Descriptor;
pub use prot::{MemoryType, Protection};
pub use table::{Level, PageTable};
pub use traits::{TableAlloc, WalkError};
pub use walk::{walk, EntrySlot};

use spin::Once;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const ENTRIES_PER_TABLE: usize = 512;
pub const VA_BITS: usize = 48;

const _: () = assert!(PAGE_SIZE == ENTRIES_PER_TABLE * core::mem::size_of::<u64>());
const _: () = assert!(table::Level::L0.shift() + 9 == VA_BITS);

static DIRECT_MAP_OFFSET: Once<u64> = Once::new();

/// Records the virtual offset of the kernel's linear map of physical
/// memory. May be called at most once, before any table is touched
/// through its physical address.
pub fn set_direct_map_offset(offset: u64) {
    DIRECT_MAP_OFFSET.call_once(|| offset);
}

/// Current linear-map offset; zero (identity) until configured.
#[inline]
#[must_use]
pub fn direct_map_offset() -> u64 {
    DIRECT_MAP_OFFSET.get().copied().unwrap_or(0)
}

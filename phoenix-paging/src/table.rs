//! Table levels and raw table access.
//!
//! A level is plain data: each one knows its shift, so the walker is a
//! single loop instead of one code path per level. Entry accesses are
//! volatile single 64-bit operations, the unit of atomicity the hardware
//! walker observes.

use core::ptr;

use crate::addr::{PhysAddr, VirtAddr};
use crate::entry::Descriptor;
use crate::ENTRIES_PER_TABLE;

const INDEX_MASK: u64 = 0x1FF;

/// Translation level, root first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    L0,
    L1,
    L2,
    L3,
}

impl Level {
    /// Low bit of the virtual-address field indexed at this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> usize {
        match self {
            Level::L0 => 39,
            Level::L1 => 30,
            Level::L2 => 21,
            Level::L3 => 12,
        }
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::L0 => Some(Level::L1),
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Level::L3)
    }

    /// Bytes of address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Index of `va` within a table at this level.
    #[inline]
    #[must_use]
    pub fn index_of(self, va: VirtAddr) -> usize {
        ((va.value() >> self.shift()) & INDEX_MASK) as usize
    }
}

/// A borrowed view of one 4 KiB table node at a known level.
#[derive(Clone, Copy)]
pub struct PageTable {
    pa: PhysAddr,
    level: Level,
}

impl PageTable {
    /// # Safety
    ///
    /// `pa` must be the physical address of a page-aligned, live table
    /// node of the given level, reachable through the linear map.
    #[inline]
    #[must_use]
    pub unsafe fn from_pa(pa: PhysAddr, level: Level) -> Self {
        debug_assert!(pa.is_page_aligned());
        Self { pa, level }
    }

    #[inline]
    #[must_use]
    pub const fn pa(self) -> PhysAddr {
        self.pa
    }

    #[inline]
    #[must_use]
    pub const fn level(self) -> Level {
        self.level
    }

    #[inline]
    pub(crate) fn entry_ptr(self, index: usize) -> *mut u64 {
        debug_assert!(index < ENTRIES_PER_TABLE);
        // SAFETY: index is in bounds of the 512-entry node backing self.
        unsafe { self.pa.as_mut_ptr::<u64>().add(index) }
    }

    /// Volatile read of one entry.
    #[inline]
    #[must_use]
    pub fn get(self, index: usize) -> Descriptor {
        // SAFETY: from_pa guarantees a live node; index checked above.
        Descriptor::from_raw(unsafe { ptr::read_volatile(self.entry_ptr(index)) })
    }

    /// Volatile write of one entry.
    ///
    /// # Safety
    ///
    /// The caller is responsible for TLB maintenance and for the
    /// descriptor being well-formed for this level.
    #[inline]
    pub unsafe fn set(self, index: usize, descriptor: Descriptor) {
        // SAFETY: same bounds argument as get; caller holds the table lock.
        unsafe { ptr::write_volatile(self.entry_ptr(index), descriptor.raw()) };
    }

    /// Clears every entry.
    ///
    /// # Safety
    ///
    /// No other core may be walking this node.
    #[inline]
    pub unsafe fn zero(self) {
        // SAFETY: the node is exactly ENTRIES_PER_TABLE u64s.
        unsafe { ptr::write_bytes(self.pa.as_mut_ptr::<u64>(), 0, ENTRIES_PER_TABLE) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Descriptor;
    use std::boxed::Box;

    #[repr(align(4096))]
    struct Node([u64; ENTRIES_PER_TABLE]);

    #[test]
    fn shifts_descend_in_nine_bit_steps() {
        assert_eq!(Level::L0.shift(), 39);
        assert_eq!(Level::L1.shift(), 30);
        assert_eq!(Level::L2.shift(), 21);
        assert_eq!(Level::L3.shift(), 12);
        assert_eq!(Level::L0.next(), Some(Level::L1));
        assert_eq!(Level::L3.next(), None);
        assert!(Level::L3.is_leaf());
    }

    #[test]
    fn index_extraction_per_level() {
        // Indices 1, 2, 3, 4 from root to leaf.
        let va = VirtAddr::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12));
        assert_eq!(Level::L0.index_of(va), 1);
        assert_eq!(Level::L1.index_of(va), 2);
        assert_eq!(Level::L2.index_of(va), 3);
        assert_eq!(Level::L3.index_of(va), 4);
    }

    #[test]
    fn get_set_round_trip() {
        let node = Box::new(Node([0; ENTRIES_PER_TABLE]));
        let pa = PhysAddr::new(Box::into_raw(node) as u64);
        // SAFETY: freshly allocated, aligned, identity-mapped on the host.
        let table = unsafe { PageTable::from_pa(pa, Level::L3) };
        let d = Descriptor::table(PhysAddr::new(0x5000));
        unsafe { table.set(7, d) };
        assert_eq!(table.get(7), d);
        assert_eq!(table.get(8), Descriptor::invalid());
        unsafe { table.zero() };
        assert_eq!(table.get(7), Descriptor::invalid());
        // SAFETY: reclaiming the Box leaked above.
        drop(unsafe { Box::from_raw(pa.as_mut_ptr::<Node>()) });
    }
}

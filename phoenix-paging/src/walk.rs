//! Walking and editing a table tree.
//!
//! The walker resolves a virtual address to its leaf slot, optionally
//! creating the intermediate nodes on the way down. It never allocates a
//! leaf frame: what lands in the slot is the caller's decision, made
//! through [`EntrySlot`]. The same depth-first traversal that frees a
//! subtree also enumerates live leaves, so teardown and inspection cannot
//! drift apart.

use crate::addr::{PhysAddr, VirtAddr};
use crate::entry::Descriptor;
use crate::prot::Protection;
use crate::table::{Level, PageTable};
use crate::traits::{TableAlloc, WalkError};
use crate::ENTRIES_PER_TABLE;

/// An exclusive reference to one leaf entry, obtained via [`walk`].
#[derive(Debug)]
pub struct EntrySlot {
    ptr: *mut u64,
    va: VirtAddr,
}

impl EntrySlot {
    #[inline]
    #[must_use]
    pub const fn va(&self) -> VirtAddr {
        self.va
    }

    #[inline]
    #[must_use]
    pub fn read(&self) -> Descriptor {
        // SAFETY: walk produced an in-bounds entry pointer into a live node.
        Descriptor::from_raw(unsafe { core::ptr::read_volatile(self.ptr) })
    }

    /// Replaces the entry with an arbitrary descriptor.
    ///
    /// # Safety
    ///
    /// The caller owns any frame the previous descriptor referenced and
    /// is responsible for TLB maintenance after the write.
    #[inline]
    pub unsafe fn write(&self, descriptor: Descriptor) {
        // SAFETY: same pointer validity argument as read.
        unsafe { core::ptr::write_volatile(self.ptr, descriptor.raw()) };
    }

    /// Installs a page descriptor for `frame`.
    ///
    /// # Safety
    ///
    /// As for [`EntrySlot::write`]; additionally `frame` must be an owned,
    /// page-aligned frame of normal memory.
    #[inline]
    pub unsafe fn install_page(&self, frame: PhysAddr, prot: Protection) {
        // SAFETY: forwarded to write.
        unsafe { self.write(Descriptor::page(frame, prot)) };
    }

    /// Installs a guard marker. No frame is consumed; accesses fault.
    ///
    /// # Safety
    ///
    /// As for [`EntrySlot::write`].
    #[inline]
    pub unsafe fn install_guard(&self) {
        // SAFETY: forwarded to write.
        unsafe { self.write(Descriptor::guard()) };
    }

    /// Clears the entry back to invalid.
    ///
    /// # Safety
    ///
    /// As for [`EntrySlot::write`].
    #[inline]
    pub unsafe fn clear(&self) {
        // SAFETY: forwarded to write.
        unsafe { self.write(Descriptor::invalid()) };
    }
}

/// Resolves `va` to its level-3 slot under `root`.
///
/// With `create` set, absent intermediate levels are allocated from
/// `alloc` and linked in; the leaf slot itself is returned as-is, valid
/// or not. Without it, an absent level yields [`WalkError::NotMapped`].
pub fn walk<A: TableAlloc>(
    root: PageTable,
    va: VirtAddr,
    create: bool,
    alloc: &mut A,
) -> Result<EntrySlot, WalkError> {
    debug_assert_eq!(root.level(), Level::L0);
    let mut table = root;
    loop {
        let level = table.level();
        let index = level.index_of(va);
        let Some(next_level) = level.next() else {
            return Ok(EntrySlot {
                ptr: table.entry_ptr(index),
                va,
            });
        };
        let entry = table.get(index);
        let next_pa = if entry.is_valid() {
            if !entry.has_table_bit() {
                return Err(WalkError::BlockMapped);
            }
            entry.output()
        } else {
            if !create {
                return Err(WalkError::NotMapped);
            }
            let node = alloc.allocate_table().ok_or(WalkError::AllocationFailed)?;
            // SAFETY: a fresh node we exclusively own; zeroed before it is
            // linked so the hardware walker never sees garbage.
            let fresh = unsafe { PageTable::from_pa(node, next_level) };
            unsafe {
                fresh.zero();
                table.set(index, Descriptor::table(node));
            }
            node
        };
        // SAFETY: the entry we just read or wrote links a live node of the
        // next level.
        table = unsafe { PageTable::from_pa(next_pa, next_level) };
    }
}

/// What [`visit_subtree`] does besides invoking the leaf callback.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Traverse {
    /// Report live leaves, touch nothing.
    Enumerate,
    /// Report live leaves, then unlink and free every table node in the
    /// visited range. `table` itself is not freed.
    Free,
}

/// Depth-first traversal of entries `first..last` of `table`, recursing
/// through every linked node below them. `va_base` is the virtual address
/// of `table`'s first entry; block descriptors are skipped, they are
/// kernel-owned and not per-space state.
pub fn visit_subtree<A, F>(
    table: PageTable,
    va_base: u64,
    first: usize,
    last: usize,
    mode: Traverse,
    alloc: &mut A,
    leaf: &mut F,
) where
    A: TableAlloc,
    F: FnMut(VirtAddr, Descriptor),
{
    debug_assert!(first <= last && last <= ENTRIES_PER_TABLE);
    let level = table.level();
    for index in first..last {
        let entry = table.get(index);
        let entry_va = va_base + index as u64 * level.span();
        if level.is_leaf() {
            if entry.is_valid() {
                leaf(VirtAddr::new(entry_va), entry);
            }
            continue;
        }
        if entry.has_table_bit() {
            let child_pa = entry.output();
            // SAFETY: a valid table entry links a live next-level node.
            let child = unsafe { PageTable::from_pa(child_pa, level.next().unwrap()) };
            visit_subtree(child, entry_va, 0, ENTRIES_PER_TABLE, mode, alloc, leaf);
            if mode == Traverse::Free {
                // SAFETY: the subtree below is already released; unlink
                // before the node is recycled.
                unsafe { table.set(index, Descriptor::invalid()) };
                alloc.free_table(child_pa);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prot::MemoryType;
    use std::alloc::{alloc_zeroed, Layout};
    use std::vec::Vec;

    struct TestTables {
        allocated: Vec<u64>,
        freed: Vec<u64>,
    }

    impl TestTables {
        fn new() -> Self {
            Self {
                allocated: Vec::new(),
                freed: Vec::new(),
            }
        }

        fn fresh_node(&mut self) -> PhysAddr {
            let layout = Layout::from_size_align(crate::PAGE_SIZE, crate::PAGE_SIZE).unwrap();
            // SAFETY: non-zero-sized layout.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.allocated.push(ptr as u64);
            PhysAddr::new(ptr as u64)
        }
    }

    impl TableAlloc for TestTables {
        fn allocate_table(&mut self) -> Option<PhysAddr> {
            Some(self.fresh_node())
        }

        fn free_table(&mut self, table: PhysAddr) {
            assert!(
                self.allocated.contains(&table.value()),
                "freed a node that was never allocated"
            );
            assert!(
                !self.freed.contains(&table.value()),
                "node freed twice"
            );
            self.freed.push(table.value());
        }
    }

    fn root_with(tables: &mut TestTables) -> PageTable {
        let pa = tables.fresh_node();
        // SAFETY: freshly allocated and zeroed.
        unsafe { PageTable::from_pa(pa, Level::L0) }
    }

    #[test]
    fn creating_walk_builds_three_intermediate_nodes() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let va = VirtAddr::new(0x4000_5000);
        let slot = walk(root, va, true, &mut tables).unwrap();
        assert_eq!(slot.read(), Descriptor::invalid());
        // Root plus L1, L2, L3.
        assert_eq!(tables.allocated.len(), 4);

        // A second walk in the same region reuses the chain.
        let _ = walk(root, VirtAddr::new(0x4000_6000), true, &mut tables).unwrap();
        assert_eq!(tables.allocated.len(), 4);
    }

    #[test]
    fn non_creating_walk_reports_not_mapped() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let err = walk(root, VirtAddr::new(0x1000), false, &mut tables).unwrap_err();
        assert_eq!(err, WalkError::NotMapped);
        assert_eq!(tables.allocated.len(), 1, "no nodes created");
    }

    #[test]
    fn installed_page_survives_a_fresh_walk() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let va = VirtAddr::new(0x7_0000_2000);
        let frame = tables.fresh_node();

        let slot = walk(root, va, true, &mut tables).unwrap();
        unsafe { slot.install_page(frame, Protection::read_write(true)) };

        let again = walk(root, va, false, &mut tables).unwrap();
        let d = again.read();
        assert!(d.is_writable());
        assert_eq!(d.output(), frame);
    }

    #[test]
    fn guard_marker_round_trips() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let va = VirtAddr::new(0x2000);
        let slot = walk(root, va, true, &mut tables).unwrap();
        unsafe { slot.install_guard() };
        assert!(walk(root, va, false, &mut tables).unwrap().read().is_guard());
    }

    #[test]
    fn walk_refuses_to_pierce_a_block() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let va = VirtAddr::new(0x4000_0000);
        // Link an L1 node, then plant a 1 GiB block in it.
        let _ = walk(root, va, true, &mut tables).unwrap();
        let l1_pa = root.get(Level::L0.index_of(va)).output();
        // SAFETY: just created by the walk above.
        let l1 = unsafe { PageTable::from_pa(l1_pa, Level::L1) };
        unsafe {
            l1.set(
                Level::L1.index_of(va),
                Descriptor::block(
                    PhysAddr::new(0x4000_0000),
                    Protection::kernel_rwx(),
                    MemoryType::Normal,
                ),
            )
        };
        let err = walk(root, va, false, &mut tables).unwrap_err();
        assert_eq!(err, WalkError::BlockMapped);
    }

    #[test]
    fn free_traversal_reports_leaves_and_releases_every_node() {
        let mut tables = TestTables::new();
        let root = root_with(&mut tables);
        let vas = [VirtAddr::new(0x1000), VirtAddr::new(0x8000_0000_0000 - 0x1000)];
        let mut frames = Vec::new();
        for &va in &vas {
            let frame = tables.fresh_node();
            let slot = walk(root, va, true, &mut tables).unwrap();
            unsafe { slot.install_page(frame, Protection::read_write(true)) };
            frames.push((va, frame));
        }

        let mut seen = Vec::new();
        visit_subtree(
            root,
            0,
            0,
            ENTRIES_PER_TABLE / 2,
            Traverse::Free,
            &mut tables,
            &mut |va, d| seen.push((va, d.output())),
        );
        seen.sort();
        frames.sort();
        assert_eq!(seen, frames);

        // Every node apart from the root and the two leaf frames is back.
        assert_eq!(tables.freed.len(), tables.allocated.len() - 3);
        for index in 0..ENTRIES_PER_TABLE {
            assert_eq!(root.get(index), Descriptor::invalid());
        }
    }
}

//! Address spaces: creation, mapping, copy-on-write duplication and
//! teardown.
//!
//! A user space owns its root node and every table node below it. The
//! whole tree sits in the TTBR0 half of the virtual address space and is
//! duplicated and torn down in full. Kernel mappings live in one
//! canonical root, pointed at by TTBR1 once at boot and shared by every
//! task, so they are never copied or freed per space.
//!
//! Duplication is two-phase. A planning pass counts the table nodes the
//! child mirror needs and acquires all of them up front; the apply pass
//! then cannot fail, so a duplication that returns an error has released
//! everything it took and has not touched the parent.

use alloc::vec::Vec;
use core::fmt;

use phoenix_arch::IrqSpinMutex;
use phoenix_paging::walk::{visit_subtree, Traverse};
use phoenix_paging::{
    walk, Descriptor, Level, MemoryType, PageTable, PhysAddr, Protection, TableAlloc, VirtAddr,
    WalkError, ENTRIES_PER_TABLE, PAGE_SIZE,
};
use spin::Once;

use crate::asid::{self, AllocatedAsid};
use crate::frames::{FrameProvider, NoTables, TableFrames};
use crate::layout::{
    BLOCK_SIZE, KERNEL_IDENTITY_SIZE, KERNEL_VIRT_BASE, USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::refcount;
use crate::shootdown::{self, ShootdownRequest};
use crate::VmError;

struct SpaceInner {
    root: PhysAddr,
    asid: AllocatedAsid,
}

/// A per-task translation tree plus its ASID.
pub struct AddressSpace {
    inner: IrqSpinMutex<SpaceInner>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddressSpace")
            .field("root", &inner.root)
            .field("asid", &inner.asid)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum MapKind {
    Page(Protection),
    Guard,
}

impl AddressSpace {
    /// A space with an empty translation tree. Kernel mappings are not
    /// copied in: the hardware reaches them through TTBR1, so every
    /// space sees them without per-task aliases.
    pub fn new_bare(frames: &dyn FrameProvider) -> Result<Self, VmError> {
        let root_pa = frames.alloc_frame().ok_or(VmError::AllocationFailure)?;
        // SAFETY: a fresh frame we exclusively own, zeroed before use.
        let root = unsafe { PageTable::from_pa(root_pa, Level::L0) };
        unsafe { root.zero() };
        Ok(Self {
            inner: IrqSpinMutex::new(SpaceInner {
                root: root_pa,
                asid: asid::allocate(),
            }),
        })
    }

    /// A user space ready for task entry: bare plus the initial stack and
    /// its guard page.
    pub fn new_user(frames: &dyn FrameProvider) -> Result<Self, VmError> {
        let space = Self::new_bare(frames)?;
        let stack_base = VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE as u64);
        if let Err(error) = space.map(stack_base, USER_STACK_SIZE, Protection::read_write(true), frames)
        {
            space.destroy(frames);
            return Err(error);
        }
        let guard = VirtAddr::new(stack_base.value() - PAGE_SIZE as u64);
        if let Err(error) = space.map_guard(guard, PAGE_SIZE, frames) {
            space.destroy(frames);
            return Err(error);
        }
        log::debug!(
            "user space created: stack {}..{}",
            stack_base,
            VirtAddr::new(USER_STACK_TOP)
        );
        Ok(space)
    }

    fn from_parts(root: PhysAddr, asid: AllocatedAsid) -> Self {
        Self {
            inner: IrqSpinMutex::new(SpaceInner { root, asid }),
        }
    }

    pub(crate) fn with_root<R>(&self, f: impl FnOnce(PageTable) -> R) -> R {
        let inner = self.inner.lock();
        // SAFETY: the root node lives as long as the space; the lock
        // serialises all edits.
        let root = unsafe { PageTable::from_pa(inner.root, Level::L0) };
        f(root)
    }

    #[must_use]
    pub fn root_pa(&self) -> PhysAddr {
        self.inner.lock().root
    }

    #[must_use]
    pub fn asid(&self) -> AllocatedAsid {
        self.inner.lock().asid
    }

    // -- mapping ---------------------------------------------------------

    /// Maps `size` bytes of fresh frames at `start` with `prot`. A page
    /// already mapped in the range is replaced and its old frame
    /// released; on failure partway the pages this call installed are
    /// rolled back.
    pub fn map(
        &self,
        start: VirtAddr,
        size: usize,
        prot: Protection,
        frames: &dyn FrameProvider,
    ) -> Result<(), VmError> {
        self.map_inner(start, size, MapKind::Page(prot), frames)
    }

    /// Installs guard markers over `size` bytes at `start`. No frames are
    /// consumed; any access faults and is fatal to the task.
    pub fn map_guard(
        &self,
        start: VirtAddr,
        size: usize,
        frames: &dyn FrameProvider,
    ) -> Result<(), VmError> {
        self.map_inner(start, size, MapKind::Guard, frames)
    }

    /// Page-granularity edits stay inside the TTBR0 half; a request
    /// reaching anywhere else would walk this space's tree with indices
    /// belonging to the kernel root, or plant tables in a non-canonical
    /// hole that teardown never visits.
    fn check_user_range(start: VirtAddr, size: usize) -> Result<(), VmError> {
        let last = start
            .value()
            .checked_add(size as u64 - 1)
            .ok_or(VmError::OutOfRange)?;
        if start.is_user_half() && VirtAddr::new(last).is_user_half() {
            Ok(())
        } else {
            Err(VmError::OutOfRange)
        }
    }

    fn map_inner(
        &self,
        start: VirtAddr,
        size: usize,
        kind: MapKind,
        frames: &dyn FrameProvider,
    ) -> Result<(), VmError> {
        if !start.is_page_aligned() || size == 0 || size % PAGE_SIZE != 0 {
            return Err(VmError::Misaligned);
        }
        Self::check_user_range(start, size)?;
        let pages = size / PAGE_SIZE;
        let inner = self.inner.lock();
        // SAFETY: as in with_root.
        let root = unsafe { PageTable::from_pa(inner.root, Level::L0) };
        let mut tables = TableFrames::new(frames);
        for i in 0..pages {
            let va = start + (i * PAGE_SIZE) as u64;
            if let Err(error) = Self::map_one(root, va, kind, frames, &mut tables) {
                Self::undo_partial(root, start, i, frames);
                drop(inner);
                shootdown::publish_range(start, i, true);
                return Err(error);
            }
        }
        drop(inner);
        shootdown::publish_range(start, pages, false);
        Ok(())
    }

    fn map_one(
        root: PageTable,
        va: VirtAddr,
        kind: MapKind,
        frames: &dyn FrameProvider,
        tables: &mut TableFrames<'_>,
    ) -> Result<(), VmError> {
        let slot = walk(root, va, true, tables).map_err(|error| match error {
            WalkError::AllocationFailed => VmError::AllocationFailure,
            WalkError::BlockMapped => VmError::BlockMapped,
            WalkError::NotMapped => VmError::NotMapped,
        })?;
        let old = slot.read();
        match kind {
            MapKind::Guard => {
                // SAFETY: leaf slot under the space lock; no frame involved.
                unsafe { slot.install_guard() };
            }
            MapKind::Page(prot) => {
                // The replacement must exist before the old reference can
                // be dropped; failing here leaves any prior mapping whole.
                let frame = frames.alloc_frame().ok_or(VmError::AllocationFailure)?;
                // SAFETY: fresh frame we own until the refcount takes over.
                unsafe { slot.install_page(frame, prot) };
                refcount::increment(frame);
            }
        }
        if old.is_valid() {
            // Replaced a live mapping: the old frame loses this space's
            // reference.
            refcount::decrement(old.output(), frames);
        }
        Ok(())
    }

    /// Releases the first `pages` pages of a partially applied map call.
    fn undo_partial(root: PageTable, start: VirtAddr, pages: usize, frames: &dyn FrameProvider) {
        let mut none = NoTables;
        for i in 0..pages {
            let va = start + (i * PAGE_SIZE) as u64;
            if let Ok(slot) = walk(root, va, false, &mut none) {
                let entry = slot.read();
                if entry.is_valid() {
                    refcount::decrement(entry.output(), frames);
                }
                if entry.is_valid() || entry.is_guard() {
                    // SAFETY: leaf slot under the space lock.
                    unsafe { slot.clear() };
                }
            }
        }
    }

    /// Removes the mappings covering `size` bytes at `start`, dropping one
    /// frame reference per live page. Guard markers are cleared too.
    /// Revocation, so the shootdown is synchronous.
    pub fn unmap(
        &self,
        start: VirtAddr,
        size: usize,
        frames: &dyn FrameProvider,
    ) -> Result<(), VmError> {
        if !start.is_page_aligned() || size == 0 || size % PAGE_SIZE != 0 {
            return Err(VmError::Misaligned);
        }
        Self::check_user_range(start, size)?;
        let pages = size / PAGE_SIZE;
        let inner = self.inner.lock();
        // SAFETY: as in with_root.
        let root = unsafe { PageTable::from_pa(inner.root, Level::L0) };
        let mut none = NoTables;
        let mut touched = 0usize;
        for i in 0..pages {
            let va = start + (i * PAGE_SIZE) as u64;
            match walk(root, va, false, &mut none) {
                Ok(slot) => {
                    let entry = slot.read();
                    if entry.is_valid() {
                        refcount::decrement(entry.output(), frames);
                    }
                    if entry.is_valid() || entry.is_guard() {
                        // SAFETY: leaf slot under the space lock.
                        unsafe { slot.clear() };
                        touched += 1;
                    }
                }
                Err(WalkError::BlockMapped) => return Err(VmError::BlockMapped),
                Err(WalkError::NotMapped | WalkError::AllocationFailed) => {}
            }
        }
        drop(inner);
        if touched == 0 {
            return Err(VmError::NotMapped);
        }
        shootdown::publish_range(start, pages, true);
        Ok(())
    }

    /// Installs 1 GiB block mappings for `[virt_start, virt_start+size)`
    /// at the fixed kernel identity offset. Kernel half only, never
    /// copy-on-write, invalidated globally afterwards.
    pub fn map_kernel(
        &self,
        virt_start: u64,
        size: u64,
        prot: Protection,
        frames: &dyn FrameProvider,
    ) -> Result<(), VmError> {
        if virt_start % BLOCK_SIZE != 0 || size == 0 || size % BLOCK_SIZE != 0 {
            return Err(VmError::Misaligned);
        }
        let last = virt_start.checked_add(size - 1).ok_or(VmError::OutOfRange)?;
        if !VirtAddr::new(virt_start).is_kernel_half() || !VirtAddr::new(last).is_kernel_half() {
            return Err(VmError::OutOfRange);
        }
        let inner = self.inner.lock();
        // SAFETY: as in with_root.
        let root = unsafe { PageTable::from_pa(inner.root, Level::L0) };
        let mut tables = TableFrames::new(frames);
        for i in 0..size / BLOCK_SIZE {
            let va = VirtAddr::new(virt_start + i * BLOCK_SIZE);
            let phys = PhysAddr::new(va.value() - KERNEL_VIRT_BASE);
            let root_index = Level::L0.index_of(va);
            let entry = root.get(root_index);
            let l1_pa = if entry.is_valid() {
                if !entry.has_table_bit() {
                    return Err(VmError::BlockMapped);
                }
                entry.output()
            } else {
                let node = tables
                    .allocate_table()
                    .ok_or(VmError::AllocationFailure)?;
                // SAFETY: fresh node, zeroed before it is linked.
                let fresh = unsafe { PageTable::from_pa(node, Level::L1) };
                unsafe {
                    fresh.zero();
                    root.set(root_index, Descriptor::table(node));
                }
                node
            };
            // SAFETY: the entry just read or written links a live L1 node.
            let l1 = unsafe { PageTable::from_pa(l1_pa, Level::L1) };
            unsafe {
                l1.set(
                    Level::L1.index_of(va),
                    Descriptor::block(phys, prot, MemoryType::Normal),
                )
            };
        }
        drop(inner);
        shootdown::publish(ShootdownRequest::All);
        log::info!(
            "kernel block mapping: {:#x}..{:#x}",
            virt_start,
            virt_start + size
        );
        Ok(())
    }

    // -- duplication -----------------------------------------------------

    /// Copy-on-write duplicate of this space.
    ///
    /// Every valid leaf in the tree ends up referencing the same frame
    /// from both spaces, write-protected and marked copy-on-write in
    /// both, with the frame's reference count one higher. Kernel mappings
    /// need no copying; they are reached through the shared kernel root.
    /// On allocation failure nothing is retained and the parent is
    /// untouched.
    pub fn duplicate(&self, frames: &dyn FrameProvider) -> Result<Self, VmError> {
        let inner = self.inner.lock();
        // SAFETY: as in with_root.
        let parent_root = unsafe { PageTable::from_pa(inner.root, Level::L0) };

        // Plan: one node per table below the root, plus the child root.
        let child_root_pa = frames.alloc_frame().ok_or(VmError::AllocationFailure)?;
        let needed = count_tables(parent_root);
        let mut pool: Vec<PhysAddr> = Vec::with_capacity(needed);
        for _ in 0..needed {
            match frames.alloc_frame() {
                Some(frame) => pool.push(frame),
                None => {
                    for frame in pool {
                        frames.free_frame(frame);
                    }
                    frames.free_frame(child_root_pa);
                    return Err(VmError::AllocationFailure);
                }
            }
        }

        // Apply: infallible from here on.
        // SAFETY: fresh frame we exclusively own.
        let child_root = unsafe { PageTable::from_pa(child_root_pa, Level::L0) };
        unsafe { child_root.zero() };
        mirror_subtree(parent_root, child_root, &mut pool);
        debug_assert!(pool.is_empty(), "duplication plan over-counted");
        let child_asid = asid::allocate();
        drop(inner);

        // Parent leaves lost write permission: revocation, so synchronous.
        shootdown::publish_sync(ShootdownRequest::All);
        log::debug!("duplicated space into asid {}", child_asid.asid);
        Ok(Self::from_parts(child_root_pa, child_asid))
    }

    // -- teardown --------------------------------------------------------

    /// Releases every mapping and table node below the root. Kernel
    /// mappings are untouched; they live in the kernel root, not here.
    pub fn destroy_user_half(&self, frames: &dyn FrameProvider) {
        let inner = self.inner.lock();
        // SAFETY: as in with_root.
        let root = unsafe { PageTable::from_pa(inner.root, Level::L0) };
        let mut tables = TableFrames::new(frames);
        visit_subtree(
            root,
            0,
            0,
            ENTRIES_PER_TABLE,
            Traverse::Free,
            &mut tables,
            &mut |_va, entry| {
                refcount::decrement(entry.output(), frames);
            },
        );
        drop(inner);
        shootdown::publish_sync(ShootdownRequest::All);
    }

    /// Full teardown on task exit: the tree, then the root node.
    pub fn destroy(self, frames: &dyn FrameProvider) {
        self.destroy_user_half(frames);
        let inner = self.inner.lock();
        frames.free_frame(inner.root);
    }

    // -- inspection ------------------------------------------------------

    /// Leaf descriptor covering `va`, if the intermediate levels exist.
    #[must_use]
    pub fn inspect(&self, va: VirtAddr) -> Option<Descriptor> {
        self.with_root(|root| walk(root, va, false, &mut NoTables).ok().map(|s| s.read()))
    }

    /// Physical frame mapped at `va`, if any.
    #[must_use]
    pub fn lookup_frame(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.inspect(va)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.output())
    }

    /// Makes this space current on the executing core. A stale ASID
    /// generation forces a reallocation and a full local flush.
    #[cfg(target_arch = "aarch64")]
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        let stale = asid::needs_refresh(&inner.asid);
        if stale {
            inner.asid = asid::allocate();
        }
        // SAFETY: inner.root is a live level-0 table for this space.
        unsafe { phoenix_arch::mmu::set_ttbr0(inner.root.value(), inner.asid.asid) };
        if stale {
            phoenix_arch::tlb::invalidate_all();
        }
    }
}

/// Tables (not leaves) linked below `table`, the node count of a
/// structural mirror. Must visit exactly what [`mirror_subtree`] visits.
fn count_tables(table: PageTable) -> usize {
    let Some(next_level) = table.level().next() else {
        return 0;
    };
    let mut count = 0;
    for index in 0..ENTRIES_PER_TABLE {
        let entry = table.get(index);
        if entry.has_table_bit() {
            count += 1;
            // SAFETY: a valid table entry links a live next-level node.
            let child = unsafe { PageTable::from_pa(entry.output(), next_level) };
            count += count_tables(child);
        }
    }
    count
}

/// Mirrors `parent` into `child`, consuming preallocated nodes from
/// `pool`. Valid leaves are shared copy-on-write; guard markers are
/// copied as markers.
fn mirror_subtree(parent: PageTable, child: PageTable, pool: &mut Vec<PhysAddr>) {
    let Some(next_level) = parent.level().next() else {
        for index in 0..ENTRIES_PER_TABLE {
            let entry = parent.get(index);
            if entry.is_valid() {
                refcount::increment(entry.output());
                let shared = if entry.is_writable() {
                    entry.with_cow_readonly()
                } else {
                    entry
                };
                unsafe {
                    // SAFETY: leaf slots under the parent's space lock;
                    // the child is not yet visible to anyone.
                    if shared != entry {
                        parent.set(index, shared);
                    }
                    child.set(index, shared);
                }
            } else if entry.is_guard() {
                // SAFETY: as above.
                unsafe { child.set(index, entry) };
            }
        }
        return;
    };
    for index in 0..ENTRIES_PER_TABLE {
        let entry = parent.get(index);
        if entry.has_table_bit() {
            // SAFETY: a valid table entry links a live next-level node.
            let parent_node = unsafe { PageTable::from_pa(entry.output(), next_level) };
            let node = pool.pop().expect("duplication plan under-counted");
            // SAFETY: preallocated node we exclusively own.
            let child_node = unsafe { PageTable::from_pa(node, next_level) };
            unsafe {
                child_node.zero();
                child.set(index, Descriptor::table(node));
            }
            mirror_subtree(parent_node, child_node, pool);
        }
    }
}

// -- the canonical kernel space ------------------------------------------

static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// Builds the canonical kernel space, installs its identity block mapping
/// and points TTBR1 at it. Idempotent; boot calls it once before any user
/// space exists.
pub fn init_kernel(frames: &dyn FrameProvider) -> Result<&'static AddressSpace, VmError> {
    if let Some(existing) = KERNEL_SPACE.get() {
        return Ok(existing);
    }
    let space = AddressSpace::new_bare(frames)?;
    if let Err(error) = space.map_kernel(
        KERNEL_VIRT_BASE,
        KERNEL_IDENTITY_SIZE,
        Protection::kernel_rwx(),
        frames,
    ) {
        space.destroy(frames);
        return Err(error);
    }
    let space = KERNEL_SPACE.call_once(|| space);
    #[cfg(target_arch = "aarch64")]
    // SAFETY: the root maps the executing kernel and lives for the rest
    // of the run.
    unsafe {
        phoenix_arch::mmu::set_ttbr1(space.root_pa().value())
    };
    Ok(space)
}

/// The canonical kernel space, if bring-up has happened.
#[must_use]
pub fn kernel_space() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

//! The physical-frame seam.
//!
//! The VM layer never talks to a concrete allocator; it takes a
//! [`FrameProvider`] wherever it may need frames. The two adapters below
//! bridge the provider to the paging crate's table allocator: table nodes
//! are plain 4 KiB frames, they are just not reference-counted.

use phoenix_paging::{PhysAddr, TableAlloc};

/// Supplier of 4 KiB physical frames.
///
/// Mapped-frame lifetimes are governed by the reference counter: the
/// counter's decrement-to-zero is the only path that calls
/// [`FrameProvider::free_frame`] for a mapped frame. Table nodes are owned
/// by their address space and freed directly.
pub trait FrameProvider: Sync {
    fn alloc_frame(&self) -> Option<PhysAddr>;
    fn free_frame(&self, frame: PhysAddr);
}

/// Adapter lending a provider to the table walker.
pub struct TableFrames<'a> {
    provider: &'a dyn FrameProvider,
}

impl<'a> TableFrames<'a> {
    pub fn new(provider: &'a dyn FrameProvider) -> Self {
        Self { provider }
    }
}

impl TableAlloc for TableFrames<'_> {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        self.provider.alloc_frame()
    }

    fn free_table(&mut self, table: PhysAddr) {
        self.provider.free_frame(table);
    }
}

/// Table allocator for walks that must not create anything. Read-only
/// walks and fault resolution use this; a creation attempt through it is
/// a logic error and reports exhaustion.
pub struct NoTables;

impl TableAlloc for NoTables {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        None
    }

    fn free_table(&mut self, _table: PhysAddr) {}
}

//! Mock hardware for host-side tests.
//!
//! Frames are 4 KiB-aligned blocks from the host allocator; with the
//! direct-map offset left at zero they are reachable through `PhysAddr`
//! pointers exactly as on the target. Freed blocks are quarantined, never
//! returned to the host, so a use-after-free hits poisoned accounting
//! instead of recycled memory.

use std::alloc::{alloc_zeroed, Layout};
use std::vec::Vec;

use phoenix_paging::{PhysAddr, PAGE_SIZE};
use spin::Mutex;

use crate::frames::FrameProvider;
use crate::refcount::{self, RefTableConfig};

struct FrameLedger {
    live: Vec<u64>,
    freed: Vec<u64>,
    budget: Option<usize>,
}

/// A [`FrameProvider`] with full accounting.
pub struct TestFrames {
    ledger: Mutex<FrameLedger>,
}

impl TestFrames {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(FrameLedger {
                live: Vec::new(),
                freed: Vec::new(),
                budget: None,
            }),
        }
    }

    /// A provider that fails after handing out `budget` frames.
    pub fn with_budget(budget: usize) -> Self {
        let this = Self::new();
        this.ledger.lock().budget = Some(budget);
        this
    }

    /// Frames handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().live.len()
    }

    pub fn was_freed(&self, frame: PhysAddr) -> bool {
        self.ledger.lock().freed.contains(&frame.value())
    }
}

impl FrameProvider for TestFrames {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        let mut ledger = self.ledger.lock();
        if let Some(ref mut budget) = ledger.budget {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: non-zero-sized layout.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        ledger.live.push(ptr as u64);
        Some(PhysAddr::new(ptr as u64))
    }

    fn free_frame(&self, frame: PhysAddr) {
        let mut ledger = self.ledger.lock();
        let position = ledger
            .live
            .iter()
            .position(|&pa| pa == frame.value())
            .expect("freed a frame that was never allocated, or freed twice");
        ledger.live.swap_remove(position);
        ledger.freed.push(frame.value());
    }
}

/// Ensures the global reference table exists. Tests share one process, so
/// this must be idempotent; frame addresses are unique across tests and
/// the shared table does not let their counts collide.
pub fn init_refcounts() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        refcount::init(RefTableConfig {
            max_tracked_frames: 1 << 16,
        });
    });
}

/// Writes a recognisable pattern into a frame.
pub fn fill_frame(frame: PhysAddr, seed: u8) {
    // SAFETY: test frames are live host allocations.
    unsafe { core::ptr::write_bytes(frame.as_mut_ptr::<u8>(), seed, PAGE_SIZE) };
}

/// First byte of a frame.
pub fn frame_byte(frame: PhysAddr) -> u8 {
    // SAFETY: test frames are live host allocations.
    unsafe { *frame.as_ptr::<u8>() }
}

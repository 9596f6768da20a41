//! Local TLB maintenance.
//!
//! These operate on the executing core only. Cross-core invalidation is a
//! protocol above this layer (see the shootdown module in the VM crate);
//! it calls back into these primitives on every participating core.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

use crate::barrier;

/// Ranges longer than this many pages are flushed with a full
/// invalidation rather than one `tlbi` per page.
pub const RANGE_THRESHOLD_PAGES: usize = 16;

const PAGE_SHIFT: u64 = 12;

/// Invalidates all stage-1 EL1 entries on this core.
#[inline]
pub fn invalidate_all() {
    barrier::dsb_ish();
    #[cfg(target_arch = "aarch64")]
    // SAFETY: TLB maintenance instructions have no memory operands.
    unsafe {
        asm!("tlbi vmalle1", options(nostack, preserves_flags));
    }
    barrier::dsb_ish();
    barrier::isb();
}

/// Invalidates the single page containing `va` on this core, last level
/// only. The entry's leaf was changed; intermediate levels are untouched.
#[inline]
pub fn invalidate_page(va: u64) {
    barrier::dsb_ish();
    #[cfg(target_arch = "aarch64")]
    // SAFETY: TLB maintenance instructions have no memory operands.
    unsafe {
        asm!("tlbi vale1, {}", in(reg) (va >> PAGE_SHIFT), options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = va;
    barrier::dsb_ish();
    barrier::isb();
}

/// Invalidates `[start, end)` on this core, falling back to a full flush
/// when the range exceeds [`RANGE_THRESHOLD_PAGES`].
pub fn invalidate_range(start: u64, end: u64) {
    debug_assert!(start <= end);
    let pages = ((end - start) >> PAGE_SHIFT) as usize;
    if pages > RANGE_THRESHOLD_PAGES {
        invalidate_all();
        return;
    }
    let mut va = start;
    while va < end {
        invalidate_page(va);
        va += 1 << PAGE_SHIFT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_invalidation_accepts_empty_and_large_ranges() {
        invalidate_range(0x1000, 0x1000);
        invalidate_range(0x1000, 0x5000);
        // Above the threshold, exercised via the full-flush path.
        invalidate_range(0, (RANGE_THRESHOLD_PAGES as u64 + 2) << PAGE_SHIFT);
    }
}

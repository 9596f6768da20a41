//! Memory and instruction barriers.
//!
//! Page-table updates must be made visible to the table walker before any
//! TLB maintenance that depends on them, hence `dsb ish` between the entry
//! store and the `tlbi`. On non-AArch64 hosts these degrade to compiler
//! fences, which is enough for the unit tests.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;
#[cfg(not(target_arch = "aarch64"))]
use core::sync::atomic::{compiler_fence, Ordering};

/// Data synchronisation barrier, inner-shareable domain.
#[inline(always)]
pub fn dsb_ish() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barriers have no memory operands.
    unsafe {
        asm!("dsb ish", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    compiler_fence(Ordering::SeqCst);
}

/// Data synchronisation barrier, full system.
#[inline(always)]
pub fn dsb_sy() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barriers have no memory operands.
    unsafe {
        asm!("dsb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    compiler_fence(Ordering::SeqCst);
}

/// Instruction synchronisation barrier.
#[inline(always)]
pub fn isb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barriers have no memory operands.
    unsafe {
        asm!("isb", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    compiler_fence(Ordering::SeqCst);
}

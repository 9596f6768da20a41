//! Core-local CPU state: interrupt masking and core identification.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Saves the current DAIF flags and masks IRQs and FIQs.
///
/// Returns the saved flags for a later [`irq_restore`]. On non-AArch64
/// hosts this is a no-op returning zero.
#[inline]
#[must_use]
pub fn irq_save_disable() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        let daif: u64;
        // SAFETY: reading DAIF and setting the I and F masks has no memory
        // effects and is always permitted at EL1.
        unsafe {
            asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
            asm!("msr daifset, #3", options(nomem, nostack, preserves_flags));
        }
        daif
    }
    #[cfg(not(target_arch = "aarch64"))]
    0
}

/// Restores DAIF flags previously saved by [`irq_save_disable`].
#[inline]
pub fn irq_restore(daif: u64) {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: restoring a value this core previously read out of DAIF.
    unsafe {
        asm!("msr daif, {}", in(reg) daif, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = daif;
}

/// Identifier of the executing core, taken from MPIDR_EL1 affinity 0.
///
/// Host fallback always reports core 0.
#[inline]
#[must_use]
pub fn core_id() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        let mpidr: u64;
        // SAFETY: MPIDR_EL1 is read-only and always accessible at EL1.
        unsafe {
            asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack, preserves_flags));
        }
        (mpidr & 0xFF) as usize
    }
    #[cfg(not(target_arch = "aarch64"))]
    0
}

/// Parks the core until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: wfi has no operands and merely idles the core.
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}

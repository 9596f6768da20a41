//! Translation-control programming: TCR, MAIR and the translation-table
//! base registers. Only meaningful on the target, so the whole module is
//! compiled for AArch64 alone.

use aarch64_cpu::registers::*;

use crate::barrier;

/// MAIR attribute index used by normal-memory descriptors.
pub const ATTR_NORMAL: u64 = 0;
/// MAIR attribute index used by device-memory descriptors.
pub const ATTR_DEVICE: u64 = 1;

/// Programs MAIR_EL1 and TCR_EL1 for 4 KiB granules and 48-bit virtual
/// addresses in both halves, with 16-bit ASIDs.
///
/// # Safety
///
/// Must run before the MMU is enabled, or with translation state the
/// caller is prepared to re-establish.
pub unsafe fn configure_translation() {
    MAIR_EL1.write(
        MAIR_EL1::Attr0_Normal_Outer::WriteBack_NonTransient_ReadWriteAlloc
            + MAIR_EL1::Attr0_Normal_Inner::WriteBack_NonTransient_ReadWriteAlloc
            + MAIR_EL1::Attr1_Device::nonGathering_nonReordering_EarlyWriteAck,
    );
    TCR_EL1.write(
        TCR_EL1::T0SZ.val(16)
            + TCR_EL1::T1SZ.val(16)
            + TCR_EL1::TG0::KiB_4
            + TCR_EL1::TG1::KiB_4
            + TCR_EL1::SH0::Inner
            + TCR_EL1::SH1::Inner
            + TCR_EL1::IRGN0::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::ORGN0::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::IRGN1::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::ORGN1::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::IPS::Bits_48
            + TCR_EL1::AS::ASID16Bits
            + TCR_EL1::EPD0::EnableTTBR0Walks
            + TCR_EL1::EPD1::EnableTTBR1Walks,
    );
    barrier::isb();
    log::debug!("translation control: 48-bit VA, 4 KiB granule, 16-bit ASIDs");
}

/// Installs the kernel-half root table.
///
/// # Safety
///
/// `root` must be the physical address of a valid, page-aligned level-0
/// table that maps the executing kernel.
pub unsafe fn set_ttbr1(root: u64) {
    TTBR1_EL1.write(TTBR1_EL1::BADDR.val(root >> 1));
    barrier::dsb_ish();
    barrier::isb();
}

/// Installs a user-half root table tagged with `asid`.
///
/// # Safety
///
/// `root` must be the physical address of a valid, page-aligned level-0
/// table. Stale translations under a reused ASID are the caller's problem;
/// the ASID allocator's generation check decides when a flush is due.
pub unsafe fn set_ttbr0(root: u64, asid: u16) {
    TTBR0_EL1.write(TTBR0_EL1::ASID.val(u64::from(asid)) + TTBR0_EL1::BADDR.val(root >> 1));
    barrier::dsb_ish();
    barrier::isb();
}

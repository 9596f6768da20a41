//! Translation-table descriptor encoding.
//!
//! One 64-bit word per entry at every level. The hardware-defined fields
//! follow the VMSAv8-64 stage-1 format; bits 55 and 56 are in the
//! software-defined range (55..=58) and carry the copy-on-write marker and
//! the guard-page marker respectively. A guard descriptor has the valid
//! bit clear, so hardware faults on it, while the marker lets the fault
//! path tell a guarded page from a plain hole.

use tock_registers::interfaces::Readable;
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;

use crate::addr::PhysAddr;
use crate::prot::{MemoryType, Protection};

register_bitfields![u64,
    pub PteFields [
        VALID OFFSET(0) NUMBITS(1) [],
        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            TableOrPage = 1
        ],
        ATTR_INDEX OFFSET(2) NUMBITS(3) [
            Normal = 0,
            Device = 1
        ],
        AP OFFSET(6) NUMBITS(2) [
            RwEl1 = 0b00,
            RwAll = 0b01,
            RoEl1 = 0b10,
            RoAll = 0b11
        ],
        SH OFFSET(8) NUMBITS(2) [
            NonShareable = 0b00,
            Outer = 0b10,
            Inner = 0b11
        ],
        AF OFFSET(10) NUMBITS(1) [],
        NG OFFSET(11) NUMBITS(1) [],
        PXN OFFSET(53) NUMBITS(1) [],
        UXN OFFSET(54) NUMBITS(1) [],
        COW OFFSET(55) NUMBITS(1) [],
        GUARD OFFSET(56) NUMBITS(1) []
    ]
];

const VALID: u64 = 1 << 0;
const TYPE_TABLE_OR_PAGE: u64 = 1 << 1;
const ATTR_DEVICE: u64 = 0b001 << 2;
const USER: u64 = 1 << 6;
const READ_ONLY: u64 = 1 << 7;
const SH_INNER: u64 = 0b11 << 8;
const ACCESS_FLAG: u64 = 1 << 10;
const NOT_GLOBAL: u64 = 1 << 11;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;
const COW: u64 = 1 << 55;
const GUARD: u64 = 1 << 56;

/// Output-address field for table and page descriptors, bits 12..=47.
const OUTPUT_MASK: u64 = 0x0000_FFFF_FFFF_F000;
/// Output-address field for level-1 block descriptors, bits 30..=47.
const L1_BLOCK_OUTPUT_MASK: u64 = 0x0000_FFFF_C000_0000;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    #[inline]
    #[must_use]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Descriptor pointing at a next-level table.
    #[must_use]
    pub fn table(next: PhysAddr) -> Self {
        debug_assert!(next.is_page_aligned());
        Self((next.value() & OUTPUT_MASK) | VALID | TYPE_TABLE_OR_PAGE)
    }

    /// Level-3 page descriptor for normal memory.
    #[must_use]
    pub fn page(frame: PhysAddr, prot: Protection) -> Self {
        debug_assert!(frame.is_page_aligned());
        let mut raw =
            (frame.value() & OUTPUT_MASK) | VALID | TYPE_TABLE_OR_PAGE | ACCESS_FLAG | SH_INNER;
        if prot.user {
            raw |= USER | NOT_GLOBAL;
        }
        if !prot.write {
            raw |= READ_ONLY;
        }
        if !prot.execute {
            raw |= UXN | PXN;
        } else if !prot.user {
            raw |= UXN;
        }
        Self(raw)
    }

    /// Level-1 block descriptor covering 1 GiB. Kernel mappings only, so
    /// always global.
    #[must_use]
    pub fn block(base: PhysAddr, prot: Protection, memory: MemoryType) -> Self {
        debug_assert_eq!(base.value() & !L1_BLOCK_OUTPUT_MASK, 0);
        let mut raw = (base.value() & L1_BLOCK_OUTPUT_MASK) | VALID | ACCESS_FLAG;
        match memory {
            MemoryType::Normal => raw |= SH_INNER,
            MemoryType::Device => raw |= ATTR_DEVICE,
        }
        if !prot.write {
            raw |= READ_ONLY;
        }
        if !prot.execute {
            raw |= UXN | PXN;
        } else {
            raw |= UXN;
        }
        Self(raw)
    }

    /// Guard-page descriptor: invalid to hardware, marked for software.
    #[inline]
    #[must_use]
    pub const fn guard() -> Self {
        Self(GUARD)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    // -- queries ---------------------------------------------------------

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & VALID != 0
    }

    /// Bits 0..=1 are `0b11`: a table pointer at levels 0..=2, a page at
    /// level 3. The walker disambiguates by level.
    #[inline]
    #[must_use]
    pub const fn has_table_bit(self) -> bool {
        self.0 & (VALID | TYPE_TABLE_OR_PAGE) == VALID | TYPE_TABLE_OR_PAGE
    }

    #[inline]
    #[must_use]
    pub const fn is_block(self) -> bool {
        self.0 & (VALID | TYPE_TABLE_OR_PAGE) == VALID
    }

    #[inline]
    #[must_use]
    pub const fn is_guard(self) -> bool {
        !self.is_valid() && self.0 & GUARD != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_cow(self) -> bool {
        self.0 & COW != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        self.0 & READ_ONLY != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 & USER != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.is_valid() && !self.is_read_only()
    }

    /// Output address of a table or page descriptor.
    #[inline]
    #[must_use]
    pub const fn output(self) -> PhysAddr {
        PhysAddr::new(self.0 & OUTPUT_MASK)
    }

    /// Output address of a level-1 block descriptor.
    #[inline]
    #[must_use]
    pub const fn block_output(self) -> PhysAddr {
        PhysAddr::new(self.0 & L1_BLOCK_OUTPUT_MASK)
    }

    /// Decoded access rights of a valid leaf descriptor.
    #[must_use]
    pub fn protection(self) -> Option<Protection> {
        if !self.is_valid() {
            return None;
        }
        let reg = InMemoryRegister::<u64, PteFields::Register>::new(self.0);
        let user = reg.matches_any(&[PteFields::AP::RwAll, PteFields::AP::RoAll]);
        let execute = if user {
            !reg.is_set(PteFields::UXN)
        } else {
            !reg.is_set(PteFields::PXN)
        };
        Some(Protection {
            read: true,
            write: !reg.matches_any(&[PteFields::AP::RoEl1, PteFields::AP::RoAll]),
            execute,
            user,
        })
    }

    // -- derived descriptors ---------------------------------------------

    /// Write-protected copy carrying the copy-on-write marker. Used when a
    /// writable leaf is shared between two address spaces.
    #[inline]
    #[must_use]
    pub const fn with_cow_readonly(self) -> Self {
        Self(self.0 | READ_ONLY | COW)
    }

    /// Writable copy with the copy-on-write marker cleared. Used when the
    /// fault path upgrades a sole-owner page in place.
    #[inline]
    #[must_use]
    pub const fn with_writable(self) -> Self {
        Self(self.0 & !(READ_ONLY | COW))
    }

    /// Same attributes, different output frame. Used when the fault path
    /// installs a private copy of a shared page.
    #[inline]
    #[must_use]
    pub fn with_output(self, frame: PhysAddr) -> Self {
        debug_assert!(frame.is_page_aligned());
        Self((self.0 & !OUTPUT_MASK) | (frame.value() & OUTPUT_MASK))
    }
}

impl core::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Descriptor({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_bit_positions() {
        let d = Descriptor::page(PhysAddr::new(0x8000_0000), Protection::read_write(true));
        let raw = d.raw();
        assert_eq!(raw & 1, 1, "valid is bit 0");
        assert_eq!(raw & (1 << 1), 1 << 1, "page type is bit 1");
        assert_eq!(raw & (1 << 6), 1 << 6, "user access is bit 6");
        assert_eq!(raw & (1 << 7), 0, "writable leaves bit 7 clear");
        assert_eq!(raw & (0b11 << 8), 0b11 << 8, "inner shareable in bits 8-9");
        assert_eq!(raw & (1 << 10), 1 << 10, "access flag is bit 10");
        assert_eq!(raw & (1 << 11), 1 << 11, "user pages are not global");
        assert_eq!(raw & (1 << 53), 1 << 53, "non-executable sets PXN");
        assert_eq!(raw & (1 << 54), 1 << 54, "non-executable sets UXN");
        assert_eq!(raw & OUTPUT_MASK, 0x8000_0000);
    }

    #[test]
    fn read_only_kernel_page() {
        let d = Descriptor::page(PhysAddr::new(0x4000), Protection::read_only(false));
        assert!(d.is_valid());
        assert!(d.is_read_only());
        assert!(!d.is_user());
        assert!(!d.is_writable());
        assert_eq!(d.raw() & (1 << 11), 0, "kernel pages are global");
    }

    #[test]
    fn table_descriptor_points_at_next_level() {
        let d = Descriptor::table(PhysAddr::new(0x1234_5000));
        assert!(d.has_table_bit());
        assert_eq!(d.output().value(), 0x1234_5000);
    }

    #[test]
    fn guard_is_invalid_but_marked() {
        let g = Descriptor::guard();
        assert!(!g.is_valid());
        assert!(g.is_guard());
        assert!(!Descriptor::invalid().is_guard());
    }

    #[test]
    fn cow_round_trip_preserves_frame_and_rights() {
        let d = Descriptor::page(PhysAddr::new(0x9_6000), Protection::read_write(true));
        let shared = d.with_cow_readonly();
        assert!(shared.is_read_only());
        assert!(shared.is_cow());
        assert_eq!(shared.output(), d.output());
        let restored = shared.with_writable();
        assert_eq!(restored, d);
    }

    #[test]
    fn with_output_swaps_only_the_frame() {
        let d = Descriptor::page(PhysAddr::new(0x1000), Protection::read_write(true));
        let moved = d.with_output(PhysAddr::new(0xABC_D000));
        assert_eq!(moved.output().value(), 0xABC_D000);
        assert_eq!(moved.raw() & !OUTPUT_MASK, d.raw() & !OUTPUT_MASK);
    }

    #[test]
    fn block_uses_gigabyte_output_field() {
        let d = Descriptor::block(
            PhysAddr::new(0x4000_0000),
            Protection::kernel_rwx(),
            MemoryType::Normal,
        );
        assert!(d.is_block());
        assert_eq!(d.block_output().value(), 0x4000_0000);
        assert_eq!(d.raw() & (1 << 11), 0, "kernel blocks are global");
    }

    #[test]
    fn protection_decode_matches_encode() {
        for prot in [
            Protection::read_write(true),
            Protection::read_only(true),
            Protection::read_execute(true),
            Protection::read_write(false),
        ] {
            let decoded = Descriptor::page(PhysAddr::new(0x7000), prot)
                .protection()
                .unwrap();
            assert_eq!(decoded, prot);
        }
        assert!(Descriptor::guard().protection().is_none());
    }
}

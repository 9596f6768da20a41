//! ASID allocation.
//!
//! Sequential allocation with a generation counter: when the 16-bit space
//! wraps, the generation advances and every address space holding an ASID
//! from an older generation must take a full TLB flush on its next switch
//! instead of trusting tagged entries. ASID 0 is reserved for the boot
//! tables.

use phoenix_arch::IrqSpinMutex;

const FIRST_ASID: u16 = 1;

/// An ASID plus the generation it was allocated in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AllocatedAsid {
    pub asid: u16,
    pub generation: u64,
}

struct AsidAllocator {
    next: u16,
    max: u16,
    generation: u64,
}

impl AsidAllocator {
    const fn new() -> Self {
        Self {
            next: FIRST_ASID,
            max: u16::MAX,
            generation: 0,
        }
    }

    fn allocate(&mut self) -> AllocatedAsid {
        let asid = self.next;
        let generation = self.generation;
        if asid == self.max {
            self.next = FIRST_ASID;
            self.generation += 1;
            log::debug!("asid space wrapped, generation now {}", self.generation);
        } else {
            self.next += 1;
        }
        AllocatedAsid { asid, generation }
    }
}

static ALLOCATOR: IrqSpinMutex<AsidAllocator> = IrqSpinMutex::new(AsidAllocator::new());

pub fn allocate() -> AllocatedAsid {
    ALLOCATOR.lock().allocate()
}

/// Whether `asid` predates the current generation and needs a full flush
/// before reuse.
#[must_use]
pub fn needs_refresh(asid: &AllocatedAsid) -> bool {
    asid.generation < ALLOCATOR.lock().generation
}

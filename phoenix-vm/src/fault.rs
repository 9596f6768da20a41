//! Write-fault resolution: the copy-on-write state machine.
//!
//! A permission fault on a write lands here. What happens next hangs off
//! the leaf descriptor and the frame's share count:
//!
//! * not mapped, or a guard marker — fatal to the task;
//! * writable already — another core got here first, refresh locally;
//! * read-only with the copy-on-write marker, sole owner — upgrade the
//!   entry in place, no copy;
//! * read-only with the marker, shared — copy the page into a fresh
//!   frame, move this space's reference, revoke the stale translation
//!   everywhere;
//! * read-only without the marker — a genuine protection violation.
//!
//! The table edit runs under the faulting space's lock, so two cores
//! faulting on the same page serialise and the loser sees the resolved
//! entry. The synchronous broadcast for a copied page happens after that
//! lock is dropped: an initiator spinning for acknowledgements must not
//! hold anything a recipient could be waiting on.

use core::fmt;

use phoenix_arch::tlb;
use phoenix_paging::{walk, PhysAddr, VirtAddr, PAGE_SIZE};

use crate::addr_space::AddressSpace;
use crate::frames::{FrameProvider, NoTables};
use crate::refcount;
use crate::shootdown::{self, ShootdownRequest};

/// Decoded exception syndrome for a data abort.
#[derive(Clone, Copy, Debug)]
pub struct FaultSyndrome(u64);

impl FaultSyndrome {
    const EC_DATA_ABORT_LOWER: u8 = 0x24;
    const EC_DATA_ABORT_SAME: u8 = 0x25;

    #[must_use]
    pub const fn new(esr: u64) -> Self {
        Self(esr)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn exception_class(self) -> u8 {
        ((self.0 >> 26) & 0x3F) as u8
    }

    #[must_use]
    pub const fn is_data_abort(self) -> bool {
        matches!(
            self.exception_class(),
            Self::EC_DATA_ABORT_LOWER | Self::EC_DATA_ABORT_SAME
        )
    }

    /// WnR: the faulting access was a write.
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    /// DFSC, the data fault status code.
    #[must_use]
    pub const fn fault_status(self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    /// Permission fault at any level (DFSC 0b0011xx).
    #[must_use]
    pub const fn is_permission_fault(self) -> bool {
        self.fault_status() & 0b11_1100 == 0b00_1100
    }

    /// Translation fault at any level (DFSC 0b0001xx).
    #[must_use]
    pub const fn is_translation_fault(self) -> bool {
        self.fault_status() & 0b11_1100 == 0b00_0100
    }
}

/// Where a faulting page stands in the copy-on-write lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultState {
    /// No translation at all.
    Unmapped,
    /// Write-protected, marked copy-on-write, frame shared with another
    /// space.
    SharedReadOnly,
    /// Write-protected, marked copy-on-write, but the last reference.
    SoleOwnerReadOnly,
    /// Already writable; nothing to resolve.
    WritableResolved,
    /// Unresolvable by this machinery.
    Fatal(FatalReason),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FatalReason {
    NotMapped,
    GuardPage,
    ProtectionViolation,
    OutOfMemory,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::NotMapped => write!(f, "address not mapped"),
            FatalReason::GuardPage => write!(f, "guard page touched"),
            FatalReason::ProtectionViolation => write!(f, "write to read-only mapping"),
            FatalReason::OutOfMemory => write!(f, "no frame for the private copy"),
        }
    }
}

/// Consumer of unresolvable faults, normally the task subsystem, which
/// terminates the offender.
pub trait FaultSink {
    fn fatal(&self, addr: VirtAddr, reason: FatalReason);
}

fn classify_entry(entry: phoenix_paging::Descriptor) -> FaultState {
    if entry.is_guard() {
        return FaultState::Fatal(FatalReason::GuardPage);
    }
    if !entry.is_valid() {
        return FaultState::Unmapped;
    }
    if entry.is_writable() {
        return FaultState::WritableResolved;
    }
    if !entry.is_cow() {
        return FaultState::Fatal(FatalReason::ProtectionViolation);
    }
    if refcount::get(entry.output()) <= 1 {
        FaultState::SoleOwnerReadOnly
    } else {
        FaultState::SharedReadOnly
    }
}

/// Classification of the page under `va` without resolving anything.
#[must_use]
pub fn classify(space: &AddressSpace, va: VirtAddr) -> FaultState {
    space.with_root(|root| match walk(root, va, false, &mut NoTables) {
        Ok(slot) => classify_entry(slot.read()),
        Err(_) => FaultState::Unmapped,
    })
}

/// Resolves a write permission fault at `va`, returning the state that
/// was found. After `Ok`, the page is privately writable by this space.
pub fn resolve_write_fault(
    space: &AddressSpace,
    va: VirtAddr,
    frames: &dyn FrameProvider,
) -> Result<FaultState, FatalReason> {
    let resolved = space.with_root(|root| {
        let slot = match walk(root, va, false, &mut NoTables) {
            Ok(slot) => slot,
            Err(_) => return Err(FatalReason::NotMapped),
        };
        let entry = slot.read();
        match classify_entry(entry) {
            FaultState::Unmapped => Err(FatalReason::NotMapped),
            FaultState::Fatal(reason) => Err(reason),
            FaultState::WritableResolved => {
                // Lost a race with another core; our stale translation is
                // the only thing left to fix.
                tlb::invalidate_page(va.value());
                Ok(FaultState::WritableResolved)
            }
            FaultState::SoleOwnerReadOnly => {
                // SAFETY: leaf slot under the space lock; same frame,
                // upgraded rights.
                unsafe { slot.write(entry.with_writable()) };
                // Nobody else can hold this translation writably, a local
                // refresh suffices.
                tlb::invalidate_page(va.value());
                log::trace!("cow: sole-owner upgrade at {va}");
                Ok(FaultState::SoleOwnerReadOnly)
            }
            FaultState::SharedReadOnly => {
                let old = entry.output();
                let fresh = frames.alloc_frame().ok_or(FatalReason::OutOfMemory)?;
                // SAFETY: old is mapped and alive (we hold a reference);
                // fresh is exclusively ours until installed.
                unsafe {
                    copy_page(old, fresh);
                    slot.write(entry.with_writable().with_output(fresh));
                }
                refcount::increment(fresh);
                refcount::decrement(old, frames);
                log::trace!("cow: copied {old} -> {fresh} at {va}");
                Ok(FaultState::SharedReadOnly)
            }
        }
    })?;
    if resolved == FaultState::SharedReadOnly {
        // The old translation must die everywhere before the fault
        // returns; the space lock is already released here.
        shootdown::publish_sync(ShootdownRequest::Page(va));
    }
    Ok(resolved)
}

/// Entry point from the data-abort vector. Returns whether the fault was
/// resolved; otherwise the sink has been told and the task should not
/// continue.
pub fn handle_data_abort(
    space: &AddressSpace,
    far: u64,
    esr: u64,
    frames: &dyn FrameProvider,
    sink: &dyn FaultSink,
) -> bool {
    let syndrome = FaultSyndrome::new(esr);
    let va = VirtAddr::new(far);
    if !syndrome.is_data_abort() || !syndrome.is_write() || !syndrome.is_permission_fault() {
        let reason = if syndrome.is_translation_fault() {
            FatalReason::NotMapped
        } else {
            FatalReason::ProtectionViolation
        };
        log::warn!("unresolvable data abort at {va}: esr {esr:#x}");
        sink.fatal(va, reason);
        return false;
    }
    match resolve_write_fault(space, va, frames) {
        Ok(_) => true,
        Err(reason) => {
            log::warn!("fatal write fault at {va}: {reason}");
            sink.fatal(va, reason);
            false
        }
    }
}

unsafe fn copy_page(src: PhysAddr, dst: PhysAddr) {
    // SAFETY: both are live page-aligned frames per the caller.
    unsafe { core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), PAGE_SIZE) };
}

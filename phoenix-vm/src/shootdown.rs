//! Cross-core TLB shootdown.
//!
//! Every core that might hold a stale translation gets an IPI telling it
//! what to invalidate; the initiator always invalidates locally first.
//! Two flavours exist. `publish` is fire-and-forget and is enough when a
//! change only adds permissions, since the worst a stale entry causes is
//! one spurious fault. `publish_sync` waits for every recipient to
//! acknowledge and must be used whenever access is being revoked:
//! unmapping, write-protecting for copy-on-write, or replacing a frame.
//!
//! The wire format is one word: zero means a full flush, anything else is
//! the page-aligned address of a single page. A real request for page
//! zero therefore degrades to a full flush, which is slower but never
//! wrong.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use phoenix_arch::{barrier, cpu, tlb};
use phoenix_paging::VirtAddr;
use spin::{Mutex, Once};

/// IPI numbers understood by [`handle_ipi`].
pub const IPI_TLB_SHOOTDOWN: u32 = 1;
pub const IPI_TLB_SHOOTDOWN_SYNC: u32 = 2;

const RANGE_THRESHOLD_PAGES: usize = tlb::RANGE_THRESHOLD_PAGES;

/// One invalidation request, as carried in the IPI argument word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShootdownRequest {
    All,
    Page(VirtAddr),
}

impl ShootdownRequest {
    #[must_use]
    pub fn encode(self) -> u64 {
        match self {
            ShootdownRequest::All => 0,
            ShootdownRequest::Page(va) => va.page_align_down().value(),
        }
    }

    #[must_use]
    pub fn decode(arg: u64) -> Self {
        if arg == 0 {
            ShootdownRequest::All
        } else {
            ShootdownRequest::Page(VirtAddr::new(arg))
        }
    }
}

/// A set of core identifiers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CpuMask(u64);

impl CpuMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, core: usize) -> bool {
        self.0 & (1 << core) != 0
    }

    #[must_use]
    pub const fn without(self, core: usize) -> Self {
        Self(self.0 & !(1 << core))
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Transport for inter-processor interrupts.
pub trait IpiSender: Sync {
    fn send_ipi(&self, targets: CpuMask, ipi: u32, arg: u64);
}

// The boot core is online before anyone can say so.
static ONLINE_CORES: AtomicU64 = AtomicU64::new(1);
static IPI_SENDER: Once<&'static dyn IpiSender> = Once::new();
static PENDING_ACKS: AtomicU32 = AtomicU32::new(0);
// Serialises synchronous publishers so the ack counter has one owner.
// Not an interrupt-masking lock: a second initiator spinning here must
// still take the first initiator's shootdown IPI and acknowledge it.
static SYNC_GATE: Mutex<()> = Mutex::new(());

/// Registers the IPI transport. One-shot; later calls are ignored.
pub fn set_ipi_sender(sender: &'static dyn IpiSender) {
    IPI_SENDER.call_once(|| sender);
}

/// Marks a core as a shootdown participant. Called as each secondary
/// core finishes bring-up.
pub fn mark_core_online(core: usize) {
    ONLINE_CORES.fetch_or(1 << core, Ordering::SeqCst);
    log::debug!("core {core} joins tlb shootdown");
}

#[must_use]
pub fn online_mask() -> CpuMask {
    CpuMask::from_bits(ONLINE_CORES.load(Ordering::SeqCst))
}

fn apply_local(request: ShootdownRequest) {
    // Order the page-table store ahead of the invalidation.
    barrier::dsb_ish();
    match request {
        ShootdownRequest::All => tlb::invalidate_all(),
        ShootdownRequest::Page(va) => tlb::invalidate_page(va.value()),
    }
}

fn remote_targets() -> CpuMask {
    online_mask().without(cpu::core_id())
}

/// Invalidates locally and notifies other online cores without waiting.
/// Only safe for permission-adding changes.
pub fn publish(request: ShootdownRequest) {
    apply_local(request);
    let targets = remote_targets();
    if targets.is_empty() {
        return;
    }
    if let Some(sender) = IPI_SENDER.get() {
        sender.send_ipi(targets, IPI_TLB_SHOOTDOWN, request.encode());
    }
}

/// Invalidates locally, notifies other online cores and spins until every
/// one has acknowledged. Required for any revocation.
///
/// The wait only terminates if every other core can reach [`handle_ipi`]:
/// call with interrupts enabled and without holding any lock the IPI
/// dispatch path takes.
pub fn publish_sync(request: ShootdownRequest) {
    apply_local(request);
    let targets = remote_targets();
    if targets.is_empty() {
        return;
    }
    let Some(sender) = IPI_SENDER.get() else {
        return;
    };
    let _gate = SYNC_GATE.lock();
    PENDING_ACKS.store(targets.count(), Ordering::Release);
    sender.send_ipi(targets, IPI_TLB_SHOOTDOWN_SYNC, request.encode());
    while PENDING_ACKS.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
}

/// Publishes an invalidation for `pages` pages starting at `start`,
/// collapsing long runs into a full flush.
pub fn publish_range(start: VirtAddr, pages: usize, sync: bool) {
    let dispatch: fn(ShootdownRequest) = if sync { publish_sync } else { publish };
    if pages > RANGE_THRESHOLD_PAGES {
        dispatch(ShootdownRequest::All);
        return;
    }
    for i in 0..pages {
        dispatch(ShootdownRequest::Page(
            start + (i * phoenix_paging::PAGE_SIZE) as u64,
        ));
    }
}

/// Recipient side, called from the IPI dispatch path. Returns whether the
/// IPI belonged to this protocol.
pub fn handle_ipi(ipi: u32, arg: u64) -> bool {
    match ipi {
        IPI_TLB_SHOOTDOWN => {
            apply_local(ShootdownRequest::decode(arg));
            true
        }
        IPI_TLB_SHOOTDOWN_SYNC => {
            apply_local(ShootdownRequest::decode(arg));
            PENDING_ACKS.fetch_sub(1, Ordering::AcqRel);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn request_wire_format_round_trips() {
        assert_eq!(ShootdownRequest::All.encode(), 0);
        let page = ShootdownRequest::Page(VirtAddr::new(0x7000_1234));
        assert_eq!(page.encode(), 0x7000_1000);
        assert_eq!(
            ShootdownRequest::decode(0x7000_1000),
            ShootdownRequest::Page(VirtAddr::new(0x7000_1000))
        );
        // Page zero is indistinguishable from a full flush on the wire.
        assert_eq!(
            ShootdownRequest::decode(ShootdownRequest::Page(VirtAddr::new(0)).encode()),
            ShootdownRequest::All
        );
    }

    #[test]
    fn mask_arithmetic() {
        let m = CpuMask::from_bits(0b1101);
        assert!(m.contains(0));
        assert!(!m.contains(1));
        assert_eq!(m.count(), 3);
        assert_eq!(m.without(2).bits(), 0b1001);
        assert!(CpuMask::empty().is_empty());
    }

    struct LoopbackSender {
        delivered: AtomicUsize,
    }

    impl IpiSender for LoopbackSender {
        fn send_ipi(&self, targets: CpuMask, ipi: u32, arg: u64) {
            // Act as every target core in turn.
            for _ in 0..targets.count() {
                assert!(handle_ipi(ipi, arg));
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    // The transport registration is one-shot for the whole process, so
    // every test here goes through the same loopback instance.
    static SENDER: LoopbackSender = LoopbackSender {
        delivered: AtomicUsize::new(0),
    };

    // Globals force the full protocol into a single test: registration,
    // fan-out excluding the initiator, and the synchronous ack drain.
    #[test]
    fn protocol_excludes_initiator_and_drains_acks() {
        set_ipi_sender(&SENDER);
        mark_core_online(1);
        mark_core_online(2);

        let targets = remote_targets();
        assert!(!targets.contains(cpu::core_id()));
        assert_eq!(targets.count(), 2);

        let before = SENDER.delivered.load(Ordering::SeqCst);
        // Returning at all proves the ack counter reached zero.
        publish_sync(ShootdownRequest::Page(VirtAddr::new(0x1234_5000)));
        assert!(SENDER.delivered.load(Ordering::SeqCst) >= before + 2);

        publish(ShootdownRequest::All);
        // Fire-and-forget leaves no ack debt; hold the gate so a
        // publisher in another thread cannot be mid-count.
        let gate = SYNC_GATE.lock();
        assert_eq!(PENDING_ACKS.load(Ordering::SeqCst), 0);
        drop(gate);

        handle_ipi(IPI_TLB_SHOOTDOWN, 0);
        assert!(!handle_ipi(0xDEAD, 0));
    }

    // Two initiators racing for the gate must both drain; the gate may
    // serialise them but must never let one block the other's acks.
    #[test]
    fn concurrent_sync_publishers_both_drain() {
        set_ipi_sender(&SENDER);
        mark_core_online(1);

        let mut handles = std::vec::Vec::new();
        for t in 0..2u64 {
            handles.push(std::thread::spawn(move || {
                for i in 0..64u64 {
                    let va = VirtAddr::new(0x6_0000_0000 + (t * 64 + i) * 0x1000);
                    publish_sync(ShootdownRequest::Page(va));
                }
            }));
        }
        // Joining at all proves neither publisher wedged the other.
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

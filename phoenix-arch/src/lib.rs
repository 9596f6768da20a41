//! AArch64 hardware primitives for the virtual-memory core.
//!
//! Everything in this crate that touches a system register or issues a
//! maintenance instruction is gated on `target_arch = "aarch64"`, with an
//! inert software fallback so the higher layers remain testable on a host
//! toolchain. The fallbacks model the ordering guarantees (compiler fences)
//! without the hardware effects.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod barrier;
pub mod cpu;
#[cfg(target_arch = "aarch64")]
pub mod mmu;
pub mod sync;
pub mod tlb;

pub use sync::IrqSpinMutex;

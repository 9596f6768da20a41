//! Fixed points of the virtual address map.

/// First byte above the initial user stack. The page at this address is
/// not part of the stack.
pub const USER_STACK_TOP: u64 = 0x0000_FFFF_FFFF_F000;

/// Initial user stack size.
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Bottom of the kernel half, the lowest address the hardware routes to
/// TTBR1. The kernel's linear mapping of physical memory starts here, so
/// a kernel virtual address translates by subtracting this base.
pub const KERNEL_VIRT_BASE: u64 = 0xFFFF_0000_0000_0000;

/// Extent of the kernel's linear mapping of physical memory, installed as
/// 1 GiB blocks at boot.
pub const KERNEL_IDENTITY_SIZE: u64 = 4 << 30;

/// 1 GiB, the span of one level-1 block.
pub const BLOCK_SIZE: u64 = 1 << 30;

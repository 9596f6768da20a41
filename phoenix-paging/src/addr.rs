//! Physical and virtual address newtypes.
//!
//! Keeping the two spaces as distinct types means a raw `u64` cannot cross
//! the boundary by accident; a physical address only becomes a pointer via
//! the linear-map offset.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{direct_map_offset, PAGE_SHIFT, PAGE_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

macro_rules! addr_common {
    ($name:ident) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (PAGE_SIZE as u64 - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn page_align_down(self) -> Self {
                Self(self.0 & !(PAGE_SIZE as u64 - 1))
            }

            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & (PAGE_SIZE as u64 - 1)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#018x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

addr_common!(PhysAddr);
addr_common!(VirtAddr);

impl PhysAddr {
    /// Physical frame number, the key used by the frame reference counter.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn from_frame(frame: u64) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    /// View through the linear map as a shared pointer.
    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        (self.0 + direct_map_offset()) as *const T
    }

    /// View through the linear map as an exclusive pointer.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        (self.0 + direct_map_offset()) as *mut T
    }
}

impl VirtAddr {
    /// Whether the address falls in the lower (user, TTBR0) half, where
    /// bits 63:48 are all clear.
    #[inline]
    #[must_use]
    pub const fn is_user_half(self) -> bool {
        self.0 >> 48 == 0
    }

    /// Whether the address falls in the upper (kernel, TTBR1) half, where
    /// bits 63:48 are all set.
    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.0 >> 48 == 0xFFFF
    }
}

//! Mapping protections and memory types, independent of the descriptor
//! encoding they lower to.

/// Access rights requested for a mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
}

impl Protection {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
            user: false,
        }
    }

    #[must_use]
    pub const fn read_only(user: bool) -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
            user,
        }
    }

    #[must_use]
    pub const fn read_write(user: bool) -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
            user,
        }
    }

    #[must_use]
    pub const fn read_execute(user: bool) -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
            user,
        }
    }

    #[must_use]
    pub const fn kernel_rwx() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
            user: false,
        }
    }
}

/// Memory attribute class, selecting the MAIR index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MemoryType {
    #[default]
    Normal,
    Device,
}

//! # Kernel Boot Information

use core::ops::Range;
use kernel_memory_addresses::PhysicalAddress;

/// One entry of the boot memory map.
///
/// Lengths are 64-bit since firmware may describe regions that end exactly
/// at (or beyond) 4 GiB.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical start address in bytes.
    pub base: u64,

    /// Length in **bytes**.
    pub length: u64,

    /// Whether the region is free RAM the kernel may allocate from.
    pub usable: bool,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            usable: true,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            usable: false,
        }
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// What memory management needs from the bootloader.
#[derive(Clone, Debug)]
pub struct BootMemory<'a> {
    /// Memory map, in any order; regions may overlap.
    pub regions: &'a [MemoryRegion],

    /// Physical bytes occupied by the loaded kernel image.
    pub kernel_image: Range<PhysicalAddress>,
}

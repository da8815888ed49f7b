#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// CR3 — Page Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical frame of the active page directory plus
/// cache-control flags for directory walks. Writing it flushes every
/// non-global TLB entry.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the directory.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the directory.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31 — Page directory physical base >> 12.
    #[bits(20)]
    directory_frame: u32,
}

impl Cr3 {
    /// Create a `Cr3` value pointing at the directory in `directory`.
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage) -> Self {
        Self::new().with_directory_frame(directory.index())
    }

    /// Frame holding the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.directory_frame())
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let cr3 = Cr3::from_directory(PhysicalPage::from_index(0x1234));
        assert_eq!(cr3.into_bits(), 0x0123_4000);
        assert_eq!(cr3.directory(), PhysicalPage::from_index(0x1234));
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// Architectural model of CR0 in 32-bit protected mode.
///
/// Only the bits memory management touches are named; the remaining
/// architectural bits are kept as opaque fields so a read-modify-write
/// preserves them.
#[bitfield(u32)]
pub struct Cr0 {
    /// Bit 0 — Protection Enable (PE).
    pub pe_protection_enable: bool,

    /// Bits 1–15 — MP, EM, TS, ET, NE and reserved bits.
    #[bits(15)]
    pub fpu_and_reserved: u16,

    /// Bit 16 — Write Protect (WP).
    ///
    /// When clear, supervisor code may write read-only pages. The
    /// copy-on-write machinery relies on this being clear so kernel
    /// writes into user pages never fault.
    pub wp_write_protect: bool,

    /// Bits 17–30 — AM, NW, CD and reserved bits.
    #[bits(14)]
    pub cache_and_reserved: u16,

    /// Bit 31 — Paging (PG).
    ///
    /// - 0: Paging disabled, linear addresses are physical.
    /// - 1: Paging enabled through the directory in CR3 (requires PE=1).
    pub pg_paging: bool,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let mut cr0: u32;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bit_is_bit_31() {
        let cr0 = Cr0::new().with_pe_protection_enable(true).with_pg_paging(true);
        assert_eq!(cr0.into_bits(), 0x8000_0001);
        assert!(!Cr0::from_bits(0x8001_0001).with_wp_write_protect(false).wp_write_protect());
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::LoadRegisterUnsafe;
use kernel_memory_addresses::VirtualAddress;

/// CR2 — Page Fault Linear Address.
///
/// Written by the CPU when a page fault is raised; read-only from the
/// kernel's point of view.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cr2(VirtualAddress);

impl Cr2 {
    #[must_use]
    pub const fn new(addr: VirtualAddress) -> Self {
        Self(addr)
    }

    /// The faulting linear address.
    #[must_use]
    pub const fn fault_address(self) -> VirtualAddress {
        self.0
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let mut cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(VirtualAddress::new(cr2))
    }
}

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code layout (i386).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15 “Page-Fault Exception (#PF)”.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch from protected page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    /// `"read"` or `"write"`.
    #[must_use]
    pub const fn access(&self) -> &'static str {
        if self.write() { "write" } else { "read" }
    }

    /// `"user"` or `"kernel"`.
    #[must_use]
    pub const fn mode(&self) -> &'static str {
        if self.user() { "user" } else { "kernel" }
    }
}

/// What the CPU reports on `#PF`: CR2 and the pushed error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self { address, error }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cr2={} err={:#x} ({} {}, {})",
            self.address,
            self.error.into_bits(),
            self.error.mode(),
            self.error.access(),
            self.error.explain()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let cow = PageFaultError::from_bits(0b111);
        assert!(cow.present() && cow.write() && cow.user());
        assert_eq!(cow.explain(), "Write access to protected page");

        let missing = PageFaultError::new().with_user(true);
        assert_eq!(missing.explain(), "Non-present page");
        assert_eq!(missing.mode(), "user");
        assert_eq!(missing.access(), "read");

        let fault = PageFault::new(VirtualAddress::new(0xBFFF_F000), cow);
        assert_eq!(
            fault.to_string(),
            "cr2=0xBFFFF000 err=0x7 (user write, Write access to protected page)"
        );
    }
}

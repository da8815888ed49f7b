use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// A single 32-bit i386 paging entry in its raw bitfield form.
///
/// Directory entries (PDE) and table entries (PTE) share this layout in
/// 32-bit paging without PAE. Each bit corresponds to a hardware-defined flag
/// or the frame number of the next level.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P` (present)   | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (PTE only) |
/// | 7     | `PS` / `PAT`    | 4 MiB page in a PDE; never used here |
/// | 8     | `G`             | Global (PTE only) |
/// | 9–11  | OS avail        | Ignored by hardware |
/// | 12–31 | `frame`         | Physical frame number |
///
/// Permissions are the intersection over the walk: a page is user-writable
/// only if both its PDE and its PTE say so.
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalPage;
/// let e = PageEntryBits::new_user_rw().with_page(PhysicalPage::from_index(0x345));
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.into_bits(), 0x0034_5007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Clear for read-only. Supervisor writes ignore this while CR0.WP = 0.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Must stay clear; only 4 KiB pages are used.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Frame number of the mapped page or next-level table.
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    /// Mask of the low twelve attribute bits.
    pub const ATTRIBUTE_MASK: u32 = 0xFFF;

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame())
    }

    #[inline]
    pub const fn set_page(&mut self, page: PhysicalPage) {
        self.set_frame(page.index());
    }

    #[inline]
    #[must_use]
    pub const fn with_page(self, page: PhysicalPage) -> Self {
        self.with_frame(page.index())
    }

    /// The attribute bits only (frame number cleared).
    #[inline]
    #[must_use]
    pub const fn attributes(self) -> Self {
        Self::from_bits(self.into_bits() & Self::ATTRIBUTE_MASK)
    }

    /// Present, writable, supervisor only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Present, read-only, user accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }
}

/// One named attribute bit, for the page bit accessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageBit {
    Present,
    Writable,
    User,
    WriteThrough,
    CacheDisabled,
    Accessed,
    Dirty,
    Global,
}

impl PageBit {
    /// Position of this bit in an entry.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Present => 1 << 0,
            Self::Writable => 1 << 1,
            Self::User => 1 << 2,
            Self::WriteThrough => 1 << 3,
            Self::CacheDisabled => 1 << 4,
            Self::Accessed => 1 << 5,
            Self::Dirty => 1 << 6,
            Self::Global => 1 << 8,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_set(self, bits: PageEntryBits) -> bool {
        bits.into_bits() & self.mask() != 0
    }

    #[inline]
    #[must_use]
    pub const fn apply(self, bits: PageEntryBits, on: bool) -> PageEntryBits {
        let raw = bits.into_bits();
        PageEntryBits::from_bits(if on { raw | self.mask() } else { raw & !self.mask() })
    }
}

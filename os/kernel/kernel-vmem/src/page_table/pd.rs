//! # Page Directory
//!
//! - [`DirIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a directory entry, always pointing at a page table
//!   (4 MiB pages are never used).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries.

use crate::PageEntryBits;
use crate::page_table::{ENTRIES, TableIndex};
use kernel_info::memory::{KERNEL_DIR_START, RECURSIVE_SLOT, USER_DIR_START};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};

/// Index into the page directory.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

impl DirIndex {
    /// The self-referencing slot.
    #[allow(clippy::cast_possible_truncation)]
    pub const RECURSIVE: Self = Self(RECURSIVE_SLOT as u16);

    /// First slot of kernel space.
    #[allow(clippy::cast_possible_truncation)]
    pub const KERNEL_START: Self = Self(KERNEL_DIR_START as u16);

    /// First slot of user space; slots below hold the kernel identity map.
    #[allow(clippy::cast_possible_truncation)]
    pub const USER_START: Self = Self(USER_DIR_START as u16);

    /// Construct from a raw index; debug-asserts `v < 1024`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    /// Directory slot covering `page`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(page: VirtualPage) -> Self {
        Self((page.index() >> 10) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn of_address(va: VirtualAddress) -> Self {
        Self::of(va.page())
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The page selected by `table` inside this slot's 4 MiB.
    #[inline]
    #[must_use]
    pub const fn page(self, table: TableIndex) -> VirtualPage {
        VirtualPage::from_index(((self.0 as u32) << 10) | table.as_u32())
    }

    #[inline]
    #[must_use]
    pub const fn first_page(self) -> VirtualPage {
        self.page(TableIndex::new(0))
    }

    /// Whether this slot covers per-process user memory.
    ///
    /// Every other slot (the low identity map, kernel space and the
    /// recursive slot) is shared by value between all address spaces.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER_START.0 && self.0 < Self::KERNEL_START.0
    }

    /// All slots, in order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES as u16).map(Self)
    }

    /// The user slots, in order.
    pub fn user() -> impl Iterator<Item = Self> {
        (Self::USER_START.0..Self::KERNEL_START.0).map(Self)
    }

    /// The kernel-space slots that hold page tables (the recursive slot excluded).
    pub fn kernel() -> impl Iterator<Item = Self> {
        (Self::KERNEL_START.0..Self::RECURSIVE.0).map(Self)
    }
}

/// A page directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    /// Point at the page table in `table`.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_page(table);
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// The page table frame, if present.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage> {
        if self.is_present() {
            Some(self.0.page())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing the active directory.
    #[inline]
    pub const fn set(&mut self, i: DirIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_round_trip() {
        let e = PdEntry::make_table(PhysicalPage::from_index(0x42), PageEntryBits::new_user_rw());
        assert_eq!(e.raw(), 0x0004_2007);
        assert_eq!(e.table(), Some(PhysicalPage::from_index(0x42)));
        assert_eq!(PdEntry::zero().table(), None);
    }

    #[test]
    fn slot_classes() {
        assert!(!DirIndex::new(0).is_user());
        assert!(DirIndex::USER_START.is_user());
        assert!(DirIndex::new(767).is_user());
        assert!(!DirIndex::KERNEL_START.is_user());
        assert!(!DirIndex::RECURSIVE.is_user());
        assert_eq!(DirIndex::all().count(), 1024);
        assert_eq!(DirIndex::user().count(), 767);
        assert_eq!(DirIndex::kernel().count(), 255);
    }

    #[test]
    fn layout() {
        assert_eq!(size_of::<PageDirectory>(), 4096);
        assert_eq!(align_of::<PageDirectory>(), 4096);
    }
}

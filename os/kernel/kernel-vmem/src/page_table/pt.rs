//! # Page Table
//!
//! - [`TableIndex`]: index type for virtual-address bits `[21:12]`.
//! - [`PtEntry`]: a PTE mapping one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};

/// Index into a page table.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    /// Table slot of `page` inside its directory slot.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(page: VirtualPage) -> Self {
        Self((page.index() & 0x3FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

/// A single page table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

impl PtEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the mapped frame and its flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage, PageEntryBits)> {
        if !self.is_present() {
            return None;
        }
        Some((self.0.page(), self.0))
    }

    /// Create a present 4 KiB leaf.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_page(page);
        Self(flags)
    }

    /// Entry with arbitrary bits, present or not.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: PageEntryBits) -> Self {
        Self(bits)
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

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Mutable access to the entry at `i`.
    #[inline]
    pub const fn entry_mut(&mut self, i: TableIndex) -> &mut PtEntry {
        &mut self.entries[i.as_usize()]
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// Iterate all present entries with their index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, PtEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(i, e)| (TableIndex(i as u16), *e))
    }

    /// Overwrite every entry with the entries of `other`.
    #[inline]
    pub const fn copy_from(&mut self, other: &Self) {
        self.entries = other.entries;
    }

    /// Clear the writable bit of every present entry.
    pub fn write_protect_all(&mut self) {
        for e in self.entries.iter_mut().filter(|e| e.is_present()) {
            e.0.set_writable(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_4k_leaf() {
        let e = PtEntry::make_4k(PhysicalPage::from_index(0x5555), PageEntryBits::new_user_ro());
        let (p, fl) = e.page_4k().unwrap();
        assert_eq!(p.base().as_u32(), 0x0555_5000);
        assert!(!fl.large_page());
        assert!(fl.user_access());
        assert!(!fl.writable());
    }

    #[test]
    fn write_protect_skips_absent_entries() {
        let mut t = PageTable::zeroed();
        t.set(
            TableIndex::new(1),
            PtEntry::make_4k(PhysicalPage::from_index(9), PageEntryBits::new_user_rw()),
        );
        t.set(TableIndex::new(2), PtEntry::from_raw(0x0000_0002)); // not present, writable
        t.write_protect_all();
        assert!(!t.get(TableIndex::new(1)).flags().writable());
        assert!(t.get(TableIndex::new(1)).is_present());
        assert_eq!(t.get(TableIndex::new(2)).raw(), 2);
        assert_eq!(t.present().count(), 1);
    }
}

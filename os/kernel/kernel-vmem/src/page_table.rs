//! # i386 Paging Structures
//!
//! Two levels, 1024 entries of 32 bits each:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//! ```
//!
//! The last directory slot points at the directory itself. Walking through
//! it once exposes every page table at `PGTBL_BASE + 4096 * dir`; walking
//! through it twice exposes the directory at `PGDIR_ADDR`.

pub mod pd;
pub mod pt;

use kernel_memory_addresses::VirtualPage;
pub use pd::{DirIndex, PageDirectory, PdEntry};
pub use pt::{PageTable, PtEntry, TableIndex};

/// Entries per directory or table.
pub const ENTRIES: usize = 1024;

#[inline]
#[must_use]
pub const fn split_indices(page: VirtualPage) -> (DirIndex, TableIndex) {
    (DirIndex::of(page), TableIndex::of(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn indices_split_the_page_number() {
        let (d, t) = split_indices(VirtualAddress::new(0xC040_3123).page());
        assert_eq!(d.as_usize(), 769);
        assert_eq!(t.as_usize(), 3);

        let (d, t) = split_indices(VirtualAddress::new(0xFFFF_F000).page());
        assert_eq!(d, DirIndex::RECURSIVE);
        assert_eq!(t.as_usize(), 1023);
    }

    #[test]
    fn page_from_indices() {
        let page = DirIndex::new(2).page(TableIndex::new(5));
        assert_eq!(page.base().as_u32(), 0x0080_5000);
        assert_eq!(DirIndex::new(3).first_page().base().as_u32(), 0x00C0_0000);
    }
}

//! # Address Space (i386, active directory)
//!
//! Walk and edit the paging structures of the **currently loaded** directory.
//!
//! ## Highlights
//!
//! - [`AddressSpace::ensure_table`] allocates and zeroes a missing page table.
//! - [`AddressSpace::map_one`] installs one 4 KiB mapping.
//! - [`AddressSpace::unmap_one`] clears one PTE and returns the frame it held.
//! - [`AddressSpace::translate`] resolves a VA to a PA.
//! - [`AddressSpace::update`] rewrites the attribute bits of one PTE.
//!
//! ## Design
//!
//! - Directory entries of user slots are always **user + writable**;
//!   the effective permission of a user page is then decided by its PTE
//!   alone, which is what copy-on-write write-protects.
//! - No TLB maintenance happens here. Callers invalidate what they change.
//!   Freshly created tables need no invalidation: their recursive window
//!   cannot be cached while the directory entry is absent.

use crate::page_table::{DirIndex, PageDirectory, PageTable, PdEntry, PtEntry, split_indices};
use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use log::trace;
use thiserror::Error;

/// Failure to install a mapping.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// Failure to remove a mapping.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum UnmapError {
    #[error("page {0} is not mapped")]
    NotMapped(VirtualPage),
}

/// Handle to the active address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn active(mapper: &'m M) -> Self {
        Self { mapper }
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Borrow the directory through the recursive slot.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn directory(&self) -> &mut PageDirectory {
        unsafe { self.mapper.directory_mut() }
    }

    /// Borrow page table `dir` if its directory entry is present.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn table(&self, dir: DirIndex) -> Option<&mut PageTable> {
        if self.directory().get(dir).is_present() {
            Some(unsafe { self.mapper.table_mut(dir) })
        } else {
            None
        }
    }

    /// Borrow page table `dir`, allocating and zeroing it if missing.
    ///
    /// Directory entries of user slots are (re)forced to user + writable.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for a new table.
    #[allow(clippy::mut_from_ref)]
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        dir: DirIndex,
    ) -> Result<&mut PageTable, MapError> {
        debug_assert_ne!(dir, DirIndex::RECURSIVE, "the recursive slot is not a table");

        let pd = self.directory();
        let pde = pd.get(dir);
        let wanted = if dir.is_user() {
            PageEntryBits::new_user_rw()
        } else {
            PageEntryBits::new_kernel_rw()
        };

        match pde.table() {
            Some(table) => {
                let flags = pde.flags();
                if dir.is_user() && !(flags.user_access() && flags.writable()) {
                    let forced = flags
                        .attributes()
                        .with_user_access(true)
                        .with_writable(true);
                    pd.set(dir, PdEntry::make_table(table, forced));
                }
                Ok(unsafe { self.mapper.table_mut(dir) })
            }
            None => {
                let frame = alloc.alloc_frame().ok_or(MapError::OutOfMemory)?;
                pd.set(dir, PdEntry::make_table(frame, wanted));
                trace!("new page table {frame} for slot {}", dir.as_usize());

                let table = unsafe { self.mapper.table_mut(dir) };
                table.zero();
                Ok(table)
            }
        }
    }

    /// Map `page → frame` with `flags` (present is forced).
    ///
    /// Overwrites whatever the PTE held before.
    ///
    /// # Errors
    /// Propagates allocation failures from [`ensure_table`](Self::ensure_table).
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let (d, t) = split_indices(page);
        let table = self.ensure_table(alloc, d)?;
        table.set(t, PtEntry::make_4k(frame, flags));
        Ok(())
    }

    /// Clear the PTE of `page` and return the frame it mapped.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] if the page had no mapping.
    pub fn unmap_one(&self, page: VirtualPage) -> Result<PhysicalPage, UnmapError> {
        let (d, t) = split_indices(page);
        let table = self.table(d).ok_or(UnmapError::NotMapped(page))?;
        let (frame, _) = table.get(t).page_4k().ok_or(UnmapError::NotMapped(page))?;
        table.set(t, PtEntry::zero());
        Ok(frame)
    }

    /// Write `entry` back as the PTE of `page`, whose table must exist.
    ///
    /// Returns the frame the PTE mapped until now, if any.
    pub fn replace(&self, page: VirtualPage, entry: PtEntry) -> Option<PhysicalPage> {
        let (d, t) = split_indices(page);
        let table = self.table(d)?;
        let old = table.get(t).page_4k().map(|(frame, _)| frame);
        table.set(t, entry);
        old
    }

    /// The PTE of `page`, if present.
    #[must_use]
    pub fn entry(&self, page: VirtualPage) -> Option<PtEntry> {
        let (d, t) = split_indices(page);
        let e = self.table(d)?.get(t);
        e.is_present().then_some(e)
    }

    /// Rewrite the bits of a present PTE; returns the new bits.
    ///
    /// `f` may change attributes only; the frame is preserved.
    pub fn update(
        &self,
        page: VirtualPage,
        f: impl FnOnce(PageEntryBits) -> PageEntryBits,
    ) -> Option<PageEntryBits> {
        let (d, t) = split_indices(page);
        let table = self.table(d)?;
        let e = table.get(t);
        let (frame, bits) = e.page_4k()?;
        let new = f(bits).with_page(frame);
        table.set(t, PtEntry::from_bits(new));
        Some(new)
    }

    /// Frame mapped at `page`, if any.
    #[must_use]
    pub fn translate_page(&self, page: VirtualPage) -> Option<PhysicalPage> {
        self.entry(page).map(|e| e.flags().page())
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate_page(va.page())
            .map(|frame| frame.base() + va.offset())
    }

    /// Both levels of the walk for `va`, for diagnostics.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Walk {
        let (d, t) = split_indices(va.page());
        let pde = self.directory().get(d);
        let pte = self.table(d).map(|table| table.get(t));
        Walk { va, pde, pte }
    }
}

/// Result of [`AddressSpace::walk`].
#[derive(Copy, Clone, Debug)]
pub struct Walk {
    pub va: VirtualAddress,
    pub pde: PdEntry,
    /// `None` if the directory entry was absent.
    pub pte: Option<PtEntry>,
}

impl fmt::Display for Walk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (d, t) = split_indices(self.va.page());
        let pde = self.pde.flags();
        write!(
            f,
            "{}: PD[{:4}]={:08x} P={} RW={} US={}",
            self.va,
            d.as_usize(),
            self.pde.raw(),
            u8::from(pde.present()),
            u8::from(pde.writable()),
            u8::from(pde.user_access()),
        )?;
        if let Some(pte) = self.pte {
            let bits = pte.flags();
            write!(
                f,
                " PT[{:4}]={:08x} P={} RW={} US={} D={}",
                t.as_usize(),
                pte.raw(),
                u8::from(bits.present()),
                u8::from(bits.writable()),
                u8::from(bits.user_access()),
                u8::from(bits.dirty()),
            )?;
        }
        Ok(())
    }
}

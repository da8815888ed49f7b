//! # Virtual Memory Support
//!
//! i386 two-level paging for a small 32-bit kernel.
//!
//! ## What you get
//! - [`PageEntryBits`], the 32-bit PDE/PTE layout, and [`PageBit`] for
//!   addressing single attribute bits.
//! - [`PageDirectory`] / [`PageTable`] with typed [`DirIndex`] / [`TableIndex`].
//! - An [`AddressSpace`] view of the **active** directory: walk, map, unmap,
//!   translate and entry updates.
//! - The capabilities the walk needs from the platform: [`PhysMapper`]
//!   (reach paging structures and kernel memory), [`BootMapper`] (reach
//!   physical memory before paging), [`Mmu`] (CR3/CR0/TLB) and
//!   [`FrameAlloc`] (physical frames).
//! - [`PageFault`], the decoded `#PF` information.
//! - A host simulator (`sim` feature) implementing all capabilities over
//!   host memory, with a TLB model.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//!
//!  CR3 → Page Directory → Page Table → 4 KiB page
//!            PDE              PTE
//! ```
//!
//! ## Recursive mapping
//!
//! Directory slot 1023 points at the directory's own frame. For the CPU, the
//! directory then doubles as a page table, so
//!
//! - page table `i` of the **active** directory is visible at
//!   `PGTBL_BASE + 4096 * i` (`0xFFC0_0000 + 4096 * i`), and
//! - the directory itself is visible at `PGDIR_ADDR` (`0xFFFF_F000`).
//!
//! No physical-memory window is needed to edit page tables; frames that do
//! not belong to the active space (a child's directory, a frame to copy)
//! are reached by temporarily mapping them into kernel space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod fault;
mod page_entry_bits;
pub mod page_table;
#[cfg(target_arch = "x86")]
pub mod recursive;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, MapError, UnmapError, Walk};
pub use crate::fault::{PageFault, PageFaultError};
pub use crate::page_entry_bits::{PageBit, PageEntryBits};
pub use crate::page_table::{DirIndex, PageDirectory, PageTable, PdEntry, PtEntry, TableIndex};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};

/// Source of **physical** 4 KiB frames for pages and page tables.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalPage>;
}

/// Access to kernel-visible memory while paging is enabled.
///
/// Only [`virt_to_mut`](PhysMapper::virt_to_mut) is required; the paging
/// structures of the active directory are reached through the recursive
/// slot by default.
pub trait PhysMapper {
    /// Borrow the object at `va`.
    ///
    /// # Safety
    /// - `va` must be mapped (supervisor-writable) in the active directory.
    /// - `T` must fit the page at `va` and match its bytes; no other live
    ///   reference may alias it for `'a`.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;

    /// Borrow the active page directory through the recursive slot.
    ///
    /// # Safety
    /// See [`virt_to_mut`](PhysMapper::virt_to_mut).
    #[inline]
    unsafe fn directory_mut<'a>(&self) -> &'a mut PageDirectory {
        unsafe { self.virt_to_mut(VirtualAddress::new(info::PGDIR_ADDR)) }
    }

    /// Borrow page table `dir` of the active directory.
    ///
    /// # Safety
    /// Directory entry `dir` must be present. See also
    /// [`virt_to_mut`](PhysMapper::virt_to_mut).
    #[inline]
    unsafe fn table_mut<'a>(&self, dir: DirIndex) -> &'a mut PageTable {
        unsafe { self.virt_to_mut(table_window(dir).base()) }
    }
}

/// Access to physical memory while paging is still off.
pub trait BootMapper {
    /// # Safety
    /// Paging must be disabled (or `pa` identity mapped); `T` must match the
    /// bytes at `pa`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The paging controls of the CPU.
pub trait Mmu {
    /// Frame of the directory in CR3.
    fn active_directory(&self) -> PhysicalPage;

    /// Load CR3. Flushes the TLB.
    ///
    /// # Safety
    /// The directory must map the executing code and the recursive slot.
    unsafe fn load_directory(&self, directory: PhysicalPage);

    /// Set CR0.PG.
    ///
    /// # Safety
    /// A directory identity mapping the executing code must be loaded.
    unsafe fn enable_paging(&self);

    /// Whether CR0.PG is set.
    fn paging_enabled(&self) -> bool;

    /// Drop the TLB entry of one page (`invlpg`).
    fn invalidate_page(&self, page: VirtualPage);

    /// Drop all non-global TLB entries (CR3 reload).
    fn flush_tlb(&self);
}

/// Virtual page at which page table `dir` of the active directory is visible.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn table_window(dir: DirIndex) -> VirtualPage {
    DirIndex::RECURSIVE.page(TableIndex::new(dir.as_usize() as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_follow_the_recursive_slot() {
        assert_eq!(
            table_window(DirIndex::new(0)).base().as_u32(),
            info::PGTBL_BASE
        );
        assert_eq!(
            table_window(DirIndex::new(768)).base().as_u32(),
            0xFFC0_0000 + 768 * 4096
        );
        assert_eq!(
            table_window(DirIndex::RECURSIVE).base().as_u32(),
            info::PGDIR_ADDR
        );
    }
}

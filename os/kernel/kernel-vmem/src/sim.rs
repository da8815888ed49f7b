//! # Host simulation of the paging hardware
//!
//! [`SimMachine`] stands in for the CPU and physical RAM in host tests. It
//! implements every capability the memory manager needs:
//!
//! - [`BootMapper`]: physical RAM is a host allocation indexed by frame.
//! - [`PhysMapper`]: kernel accesses walk the active directory exactly like
//!   the MMU, so the recursive slot works without special casing.
//! - [`Mmu`]: CR3, CR0.PG and a TLB model.
//!
//! User-visible behaviour is exercised with [`SimMachine::read_u8`] /
//! [`SimMachine::write_u8`], which walk (or hit the TLB), check permissions
//! and report a [`PageFault`] the way `#PF` would. The TLB is filled on
//! access and only emptied by `invalidate_page`, `flush_tlb`, a directory
//! load or a fault on that page, so a missing invalidation shows up as a
//! stale translation.
//!
//! Supervisor accesses ignore read-only pages (CR0.WP = 0).

use crate::page_table::{PdEntry, PtEntry, TableIndex, split_indices};
use crate::{BootMapper, Mmu, PageEntryBits, PageFault, PageFaultError, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell, UnsafeCell};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

impl Frame {
    fn zeroed() -> Self {
        Self(UnsafeCell::new([0; PAGE_SIZE as usize]))
    }
}

/// Who performs a simulated access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Kernel,
    User,
}

/// Simulated CPU + RAM.
pub struct SimMachine {
    ram: Box<[Frame]>,
    cr3: Cell<PhysicalPage>,
    paging: Cell<bool>,
    /// Cached translations: frame plus the combined PDE/PTE permissions.
    tlb: RefCell<BTreeMap<VirtualPage, PageEntryBits>>,
    invalidations: Cell<usize>,
    flushes: Cell<usize>,
}

impl SimMachine {
    /// A machine with `frames` frames of RAM starting at physical address 0.
    #[must_use]
    pub fn new(frames: u32) -> Self {
        Self {
            ram: (0..frames).map(|_| Frame::zeroed()).collect(),
            cr3: Cell::new(PhysicalPage::from_index(0)),
            paging: Cell::new(false),
            tlb: RefCell::new(BTreeMap::new()),
            invalidations: Cell::new(0),
            flushes: Cell::new(0),
        }
    }

    /// Number of frames of RAM.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn frames(&self) -> u32 {
        self.ram.len() as u32
    }

    fn frame_ptr(&self, frame: PhysicalPage) -> *mut u8 {
        let Some(f) = self.ram.get(frame.index() as usize) else {
            panic!("{frame:?} is outside simulated RAM");
        };
        f.0.get().cast()
    }

    fn raw_entry(&self, frame: PhysicalPage, index: usize) -> u32 {
        unsafe { self.frame_ptr(frame).cast::<u32>().add(index).read() }
    }

    fn set_raw_entry(&self, frame: PhysicalPage, index: usize, value: u32) {
        unsafe { self.frame_ptr(frame).cast::<u32>().add(index).write(value) }
    }

    /// Read one byte of physical memory.
    #[must_use]
    pub fn phys_u8(&self, pa: PhysicalAddress) -> u8 {
        unsafe { self.frame_ptr(pa.page()).add(pa.offset() as usize).read() }
    }

    /// Fill a whole frame with `byte`, bypassing paging.
    pub fn fill_frame(&self, frame: PhysicalPage, byte: u8) {
        unsafe { self.frame_ptr(frame).write_bytes(byte, PAGE_SIZE as usize) }
    }

    /// Whether every byte of `frame` equals `byte`.
    #[must_use]
    pub fn frame_is_filled_with(&self, frame: PhysicalPage, byte: u8) -> bool {
        (0..PAGE_SIZE).all(|off| self.phys_u8(frame.base() + off) == byte)
    }

    /// Walk the active directory. `None` if either level is absent.
    fn walk(&self, page: VirtualPage) -> Option<(PdEntry, PtEntry)> {
        let (d, t) = split_indices(page);
        let pde = PdEntry::from_raw(self.raw_entry(self.cr3.get(), d.as_usize()));
        let table = pde.table()?;
        let pte = PtEntry::from_raw(self.raw_entry(table, t.as_usize()));
        pte.is_present().then_some((pde, pte))
    }

    /// Translate for an access, like the MMU would.
    ///
    /// # Errors
    /// The `#PF` the access raises.
    pub fn access(
        &self,
        va: VirtualAddress,
        write: bool,
        mode: Mode,
    ) -> Result<PhysicalAddress, PageFault> {
        if !self.paging.get() {
            return Ok(PhysicalAddress::new(va.as_u32()));
        }

        let page = va.page();
        let user = mode == Mode::User;
        let fault = |present: bool| {
            self.tlb.borrow_mut().remove(&page);
            Err(PageFault::new(
                va,
                PageFaultError::new()
                    .with_present(present)
                    .with_write(write)
                    .with_user(user),
            ))
        };

        let cached = self.tlb.borrow().get(&page).copied();
        let bits = if let Some(bits) = cached {
            bits
        } else {
            let Some((pde, pte)) = self.walk(page) else {
                return fault(false);
            };
            let (p, t) = (pde.flags(), pte.flags());
            let combined = t
                .with_user_access(p.user_access() && t.user_access())
                .with_writable(p.writable() && t.writable());

            let updated = t.with_accessed(true).with_dirty(t.dirty() || write);
            if let Some(table) = pde.table() {
                self.set_raw_entry(table, TableIndex::of(page).as_usize(), updated.into_bits());
            }
            combined
        };

        if user && (!bits.user_access() || (write && !bits.writable())) {
            return fault(true);
        }

        self.tlb.borrow_mut().insert(page, bits);
        Ok(bits.page().base() + va.offset())
    }

    /// Read a byte through paging.
    ///
    /// # Errors
    /// The `#PF` the access raises.
    pub fn read_u8(&self, va: VirtualAddress, mode: Mode) -> Result<u8, PageFault> {
        let pa = self.access(va, false, mode)?;
        Ok(self.phys_u8(pa))
    }

    /// Write a byte through paging.
    ///
    /// # Errors
    /// The `#PF` the access raises.
    pub fn write_u8(&self, va: VirtualAddress, value: u8, mode: Mode) -> Result<(), PageFault> {
        let pa = self.access(va, true, mode)?;
        unsafe { self.frame_ptr(pa.page()).add(pa.offset() as usize).write(value) };
        Ok(())
    }

    /// Whether `page` currently has a TLB entry.
    #[must_use]
    pub fn is_cached(&self, page: VirtualPage) -> bool {
        self.tlb.borrow().contains_key(&page)
    }

    /// Number of `invalidate_page` calls so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// Number of `flush_tlb` calls so far.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }
}

impl BootMapper for SimMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(size_of::<T>() <= (PAGE_SIZE - pa.offset()) as usize);
        unsafe { &mut *self.frame_ptr(pa.page()).add(pa.offset() as usize).cast::<T>() }
    }
}

impl PhysMapper for SimMachine {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        if !self.paging.get() {
            return unsafe { self.phys_to_mut(PhysicalAddress::new(va.as_u32())) };
        }

        let Some((_, pte)) = self.walk(va.page()) else {
            panic!("kernel page fault at {va}");
        };
        unsafe { self.phys_to_mut(pte.flags().page().base() + va.offset()) }
    }
}

impl Mmu for SimMachine {
    fn active_directory(&self) -> PhysicalPage {
        self.cr3.get()
    }

    unsafe fn load_directory(&self, directory: PhysicalPage) {
        self.cr3.set(directory);
        self.tlb.borrow_mut().clear();
    }

    unsafe fn enable_paging(&self) {
        self.paging.set(true);
    }

    fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    fn invalidate_page(&self, page: VirtualPage) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.tlb.borrow_mut().remove(&page);
    }

    fn flush_tlb(&self) {
        self.flushes.set(self.flushes.get() + 1);
        self.tlb.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::{DirIndex, PageDirectory, PageTable};
    use crate::{AddressSpace, FrameAlloc, table_window};

    struct Bump(u32);

    impl FrameAlloc for Bump {
        fn alloc_frame(&mut self) -> Option<PhysicalPage> {
            self.0 += 1;
            Some(PhysicalPage::from_index(self.0 - 1))
        }
    }

    /// Directory in frame 1, recursive slot installed, identity map of
    /// frames 0..16 through a table in frame 2, paging on.
    fn booted() -> (SimMachine, Bump) {
        let sim = SimMachine::new(64);
        let dir_frame = PhysicalPage::from_index(1);
        let table_frame = PhysicalPage::from_index(2);
        unsafe {
            let pd: &mut PageDirectory = sim.phys_to_mut(dir_frame.base());
            let flags = PageEntryBits::new_kernel_rw();
            pd.set(DirIndex::new(0), PdEntry::make_table(table_frame, flags));
            pd.set(DirIndex::RECURSIVE, PdEntry::make_table(dir_frame, flags));
            let pt: &mut PageTable = sim.phys_to_mut(table_frame.base());
            for i in 0..16 {
                let frame = PhysicalPage::from_index(u32::from(i));
                pt.set(TableIndex::new(i), PtEntry::make_4k(frame, flags));
            }
            sim.load_directory(dir_frame);
            sim.enable_paging();
        }
        (sim, Bump(16))
    }

    #[test]
    fn recursive_slot_exposes_tables_and_directory() {
        let (sim, _) = booted();
        let pd = unsafe { sim.directory_mut() };
        assert_eq!(
            pd.get(DirIndex::RECURSIVE).table(),
            Some(PhysicalPage::from_index(1))
        );

        let pt = unsafe { sim.table_mut(DirIndex::new(0)) };
        assert_eq!(
            pt.get(TableIndex::new(3)).page_4k().map(|(f, _)| f),
            Some(PhysicalPage::from_index(3))
        );
        assert_eq!(
            sim.access(table_window(DirIndex::new(0)).base(), false, Mode::Kernel),
            Ok(PhysicalPage::from_index(2).base())
        );
    }

    #[test]
    fn user_access_checks_both_levels() {
        let (sim, mut frames) = booted();
        let space = AddressSpace::active(&sim);
        let page = VirtualAddress::new(0x0040_0000).page();
        space
            .map_one(&mut frames, page, PhysicalPage::from_index(20), PageEntryBits::new_user_ro())
            .unwrap();

        assert!(sim.write_u8(page.base(), 7, Mode::Kernel).is_ok());
        assert_eq!(sim.read_u8(page.base(), Mode::User), Ok(7));

        let err = sim.write_u8(page.base(), 1, Mode::User).unwrap_err();
        assert!(err.error.present() && err.error.write() && err.error.user());
        assert!(!sim.is_cached(page));

        let err = sim
            .read_u8(VirtualAddress::new(0x0080_0000), Mode::User)
            .unwrap_err();
        assert!(!err.error.present());

        // Identity map is supervisor only.
        let err = sim
            .read_u8(VirtualAddress::new(0x1000), Mode::User)
            .unwrap_err();
        assert!(err.error.present());
    }

    #[test]
    fn stale_translations_survive_until_invalidated() {
        let (sim, mut frames) = booted();
        let space = AddressSpace::active(&sim);
        let page = VirtualAddress::new(0x0040_0000).page();
        space
            .map_one(&mut frames, page, PhysicalPage::from_index(20), PageEntryBits::new_user_rw())
            .unwrap();
        sim.write_u8(page.base(), 1, Mode::User).unwrap();

        space.update(page, |b| b.with_writable(false)).unwrap();
        assert!(sim.write_u8(page.base(), 2, Mode::User).is_ok(), "TLB still says writable");

        sim.invalidate_page(page);
        assert!(sim.write_u8(page.base(), 3, Mode::User).is_err());
        assert_eq!(sim.invalidations(), 1);
    }
}

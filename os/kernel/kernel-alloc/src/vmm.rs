//! The virtual memory manager.
//!
//! [`Vmm`] owns the frame bitmap and the range free-lists and edits the
//! page tables of the active directory through the platform capabilities.
//! There is one per kernel; tests build as many as they like on top of
//! [`SimMachine`](kernel_vmem::sim::SimMachine).
//!
//! Every public operation runs with interrupts disabled for its whole body
//! ([`IrqGuard`]); nested operations simply nest the guards.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::bootstrap(X86Paging, frames, kernel_image, VmmConfig::default());
//! let heap = vmm.pgalloc(16, Area::Kernel, None)?;
//! vmm.pgfree(heap, 16, None);
//! ```

use crate::frame_alloc::BitmapFrameAlloc;
use crate::process::UserSpace;
use crate::range_alloc::{Area, RangeError, VirtualRangeAllocator};
use crate::vm_page::{VmPage, VmPageRegistry};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory::{
    KMEM_START, PGTBL_BASE, STACK_GROWTH_MAX_PAGES, TRANSIENT_WINDOW_PAGES, USER_MEM_START,
};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};
use kernel_sync::IrqGuard;
use kernel_vmem::page_table::split_indices;
use kernel_vmem::{
    AddressSpace, BootMapper, DirIndex, FrameAlloc, MapError, Mmu, PageBit, PageDirectory,
    PageEntryBits, PageTable, PdEntry, PhysMapper, PtEntry, UnmapError,
};
use log::{debug, error, info, trace, warn};
use thiserror::Error;

/// Spare range nodes kept around so a free never runs dry mid-operation.
///
/// A free straddling the split needs two.
const MIN_SPARE_NODES: u32 = 2;

/// A page as `map_range` found it.
struct Prior {
    entry: Option<PtEntry>,
    /// Frame of the owner's record, if there was one.
    recorded: Option<PhysicalPage>,
}

/// Runtime tunables of the memory manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmmConfig {
    /// How many pages below the stack boundary a fault may grow the stack.
    pub stack_growth_max_pages: u32,

    /// Pages managed by the user free-list.
    pub user_area: Range<VirtualPage>,

    /// Pages managed by the kernel free-list. The first page becomes the
    /// seed of the range node pool.
    pub kernel_area: Range<VirtualPage>,
}

impl Default for VmmConfig {
    fn default() -> Self {
        let page = |addr| VirtualPage::containing_address(VirtualAddress::new(addr));
        Self {
            stack_growth_max_pages: STACK_GROWTH_MAX_PAGES,
            user_area: page(USER_MEM_START)..page(KMEM_START),
            kernel_area: page(KMEM_START)..page(PGTBL_BASE),
        }
    }
}

/// A page bit accessor hit an unmapped page.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PageBitError {
    #[error("page {0} is not mapped")]
    NotMapped(VirtualPage),
}

/// The memory-management context.
pub struct Vmm<P> {
    pub(crate) platform: P,
    pub(crate) frames: BitmapFrameAlloc,
    pub(crate) ranges: VirtualRangeAllocator,
    pub(crate) windows: [VirtualPage; TRANSIENT_WINDOW_PAGES as usize],
    pub(crate) config: VmmConfig,
    boot_directory: PhysicalPage,
}

impl<P: PhysMapper + BootMapper + Mmu> Vmm<P> {
    /// Build the first address space and turn paging on.
    ///
    /// With paging still off: allocate a directory, identity map every
    /// page of `kernel_image` (supervisor only) and point the last slot at
    /// the directory itself. Then load it, enable paging, seed the range
    /// allocator, reserve the transient windows and allocate every kernel
    /// page table up front so kernel directory entries are identical in
    /// all address spaces forever after.
    ///
    /// # Panics
    /// If paging is already on, the image reaches into user space, or
    /// physical memory runs out.
    pub fn bootstrap(
        platform: P,
        mut frames: BitmapFrameAlloc,
        kernel_image: Range<PhysicalAddress>,
        config: VmmConfig,
    ) -> Self {
        let _irq = IrqGuard::new();
        assert!(!platform.paging_enabled(), "paging is already enabled");
        assert!(
            kernel_image.end.as_u32() <= config.user_area.start.base().as_u32(),
            "kernel image overlaps user space"
        );

        let directory = frames.alloc();
        let pd: &mut PageDirectory = unsafe { platform.phys_to_mut(directory.base()) };
        pd.zero();
        pd.set(
            DirIndex::RECURSIVE,
            PdEntry::make_table(directory, PageEntryBits::new_kernel_rw()),
        );

        let first = kernel_image.start.page();
        let end = kernel_image.end.as_u32().div_ceil(PAGE_SIZE);
        for frame in (first.index()..end).map(PhysicalPage::from_index) {
            identity_map(&platform, &mut frames, pd, frame);
        }

        unsafe {
            platform.load_directory(directory);
            platform.enable_paging();
        }
        info!("paging enabled, directory at {directory}");

        let seed = config.kernel_area.start;
        let seed_frame = frames.alloc();
        let space = AddressSpace::active(&platform);
        fatal_on_oom(space.map_one(&mut frames, seed, seed_frame, PageEntryBits::new_kernel_rw()));

        let mut ranges = VirtualRangeAllocator::new(
            &platform,
            seed,
            seed + 1..config.kernel_area.end,
            config.user_area.clone(),
        );

        let Some(window) = ranges.take(&platform, TRANSIENT_WINDOW_PAGES, Area::Kernel) else {
            error!("no kernel virtual memory for the transient windows");
            panic!("kernel area too small");
        };
        let windows = core::array::from_fn(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let i = i as u32;
            window + i
        });

        for dir in DirIndex::kernel() {
            fatal_on_oom(space.ensure_table(&mut frames, dir).map(|_| ()));
        }

        info!(
            "vmm ready: {} frames free, windows at {window}",
            frames.free_count()
        );
        Self {
            platform,
            frames,
            ranges,
            windows,
            config,
            boot_directory: directory,
        }
    }
}

/// Identity map `frame` while paging is off.
fn identity_map<P: BootMapper>(
    platform: &P,
    frames: &mut BitmapFrameAlloc,
    pd: &mut PageDirectory,
    frame: PhysicalPage,
) {
    let page = VirtualPage::from_index(frame.index());
    let (d, t) = split_indices(page);
    let table = if let Some(table) = pd.get(d).table() {
        table
    } else {
        let table = frames.alloc();
        unsafe { platform.phys_to_mut::<PageTable>(table.base()) }.zero();
        pd.set(d, PdEntry::make_table(table, PageEntryBits::new_kernel_rw()));
        table
    };
    let pt: &mut PageTable = unsafe { platform.phys_to_mut(table.base()) };
    pt.set(t, PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw()));
}

/// Kernel mappings that cannot tolerate a missing frame.
fn fatal_on_oom(result: Result<(), MapError>) {
    if let Err(err) = result {
        error!("kernel mapping failed: {err}");
        panic!("out of physical memory");
    }
}

impl<P: PhysMapper + Mmu> Vmm<P> {
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub const fn config(&self) -> &VmmConfig {
        &self.config
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc {
        &self.frames
    }

    /// Number of free physical frames.
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.frames.free_count()
    }

    /// Free runs of `area`, in address order.
    #[must_use]
    pub fn free_ranges(&self, area: Area) -> Vec<Range<VirtualPage>> {
        self.ranges.free_ranges(&self.platform, area)
    }

    /// The address space built by [`bootstrap`](Vmm::bootstrap), with no
    /// user pages recorded. It becomes the first process.
    #[must_use]
    pub const fn initial_space(&self) -> UserSpace {
        UserSpace::new(self.boot_directory)
    }

    /// Frame of the directory currently loaded.
    #[must_use]
    pub fn active_directory(&self) -> PhysicalPage {
        self.platform.active_directory()
    }

    /// Load the directory of `space`.
    pub fn switch_to(&self, space: &UserSpace) {
        let _irq = IrqGuard::new();
        // Every directory handed out by this manager maps the kernel and
        // its own recursive slot.
        unsafe { self.platform.load_directory(space.directory()) };
        trace!("switched to directory {}", space.directory());
    }

    /// Map `page` to `frame`, or to a fresh frame if `frame` is `None`.
    ///
    /// For user pages with an `owner`, the owner's record of `page` is
    /// created, or repointed at the new frame if it already exists.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the page or its table.
    pub fn map_page(
        &mut self,
        page: VirtualPage,
        frame: Option<PhysicalPage>,
        flags: PageEntryBits,
        owner: Option<&mut VmPageRegistry>,
    ) -> Result<PhysicalPage, MapError> {
        let _irq = IrqGuard::new();
        let (frame, fresh) = match frame {
            Some(frame) => (frame, false),
            None => (self.frames.alloc_frame().ok_or(MapError::OutOfMemory)?, true),
        };

        let space = AddressSpace::active(&self.platform);
        if let Err(err) = space.map_one(&mut self.frames, page, frame, flags) {
            if fresh {
                self.frames.free(frame);
            }
            return Err(err);
        }
        self.platform.invalidate_page(page);
        trace!("map {page} -> {frame}");

        if DirIndex::of(page).is_user()
            && let Some(registry) = owner
        {
            match registry.get(page) {
                Some(record) => record.set_physical_page(frame),
                None => {
                    registry.insert(VmPage::new(page, frame, flags));
                }
            }
        }
        Ok(frame)
    }

    /// Remove the mapping of `page`; the frame is not freed.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] if there was nothing to unmap.
    pub fn unmap_page(&mut self, page: VirtualPage) -> Result<PhysicalPage, UnmapError> {
        let _irq = IrqGuard::new();
        match AddressSpace::active(&self.platform).unmap_one(page) {
            Ok(frame) => {
                self.platform.invalidate_page(page);
                trace!("unmap {page} (was {frame})");
                Ok(frame)
            }
            Err(err) => {
                warn!("unmap_page: {err}");
                Err(err)
            }
        }
    }

    /// Map `count` pages from `start`, to consecutive frames from
    /// `first_frame` or to fresh frames.
    ///
    /// All or nothing: on failure every page touched so far gets back the
    /// entry and the record frame it had before, and fresh frames are freed.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`].
    pub fn map_range(
        &mut self,
        start: VirtualPage,
        count: u32,
        first_frame: Option<PhysicalPage>,
        flags: PageEntryBits,
        mut owner: Option<&mut VmPageRegistry>,
    ) -> Result<(), MapError> {
        let _irq = IrqGuard::new();
        let mut before = Vec::new();
        for (i, page) in (0..count).zip(start.pages(count)) {
            let prior = Prior {
                entry: AddressSpace::active(&self.platform).entry(page),
                recorded: owner
                    .as_deref()
                    .and_then(|registry| registry.get(page))
                    .map(|record| record.physical_page()),
            };
            let frame = first_frame.map(|f| f + i);
            if let Err(err) = self.map_page(page, frame, flags, owner.as_deref_mut()) {
                self.roll_back(start, &before, first_frame.is_none(), owner);
                return Err(err);
            }
            before.push(prior);
        }
        Ok(())
    }

    fn roll_back(
        &mut self,
        start: VirtualPage,
        before: &[Prior],
        owns_frames: bool,
        mut owner: Option<&mut VmPageRegistry>,
    ) {
        let space = AddressSpace::active(&self.platform);
        for (i, prior) in (0..).zip(before) {
            let page = start + i;
            let mapped = match prior.entry {
                Some(entry) => space.replace(page, entry),
                None => space.unmap_one(page).ok(),
            };
            self.platform.invalidate_page(page);
            if owns_frames && let Some(frame) = mapped {
                self.frames.free(frame);
            }

            let Some(registry) = owner.as_deref_mut() else {
                continue;
            };
            match prior.recorded {
                Some(frame) => {
                    if let Some(record) = registry.get(page) {
                        record.set_physical_page(frame);
                    }
                }
                None => {
                    registry.remove(page);
                }
            }
        }
        trace!("rolled back {} pages at {start}", before.len());
    }

    /// Map the bytes `[va, va + size)` to the physical bytes starting at `pa`.
    ///
    /// Every page touched by the range is mapped; `va` and `pa` must share
    /// their page offset.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`].
    pub fn map_mem_range(
        &mut self,
        va: VirtualAddress,
        size: u32,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        debug_assert_eq!(va.offset(), pa.offset(), "offsets differ");
        if size == 0 {
            return Ok(());
        }
        let first = va.page();
        let last = VirtualAddress::new(va.as_u32().saturating_add(size - 1)).page();
        self.map_range(first, last - first + 1, Some(pa.page()), flags, None)
    }

    /// Unmap `count` pages from `start`; frames are not freed.
    ///
    /// # Errors
    /// The first [`UnmapError`]; the remaining pages are still unmapped.
    pub fn unmap_range(&mut self, start: VirtualPage, count: u32) -> Result<(), UnmapError> {
        let _irq = IrqGuard::new();
        let mut result = Ok(());
        for page in start.pages(count) {
            if let Err(err) = self.unmap_page(page) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Physical address `va` maps to in the active directory.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        AddressSpace::active(&self.platform).translate(va)
    }

    /// Frame mapped at `page` in the active directory.
    #[must_use]
    pub fn translate_page(&self, page: VirtualPage) -> Option<PhysicalPage> {
        AddressSpace::active(&self.platform).translate_page(page)
    }

    /// Allocate `count` consecutive pages of `area`, each backed by a fresh
    /// frame (user pages are mapped user + writable).
    ///
    /// # Errors
    /// - [`RangeError::Exhausted`] if no free run is large enough.
    /// - [`RangeError::Backing`] if frames ran out; nothing stays allocated.
    pub fn pgalloc(
        &mut self,
        count: u32,
        area: Area,
        owner: Option<&mut VmPageRegistry>,
    ) -> Result<VirtualPage, RangeError> {
        let _irq = IrqGuard::new();
        if count == 0 {
            return Err(RangeError::OutOfRange);
        }
        self.ensure_spare_nodes();

        let Some(start) = self.ranges.take(&self.platform, count, area) else {
            warn!("pgalloc: no run of {count} free pages in the {area:?} area");
            return Err(RangeError::Exhausted);
        };
        self.back_range(start, count, area, owner)?;
        debug!("pgalloc {count} pages at {start}");
        Ok(start)
    }

    /// Allocate exactly `[start, start + count)`.
    ///
    /// # Errors
    /// The rejection of the range allocator, or [`RangeError::Backing`].
    pub fn pgalloc_fixed(
        &mut self,
        start: VirtualPage,
        count: u32,
        owner: Option<&mut VmPageRegistry>,
    ) -> Result<(), RangeError> {
        let _irq = IrqGuard::new();
        self.ensure_spare_nodes();

        let area = match self.ranges.take_fixed(&self.platform, start, count) {
            Ok(area) => area,
            Err(err) => {
                warn!("pgalloc_fixed({start}, {count}): {err}");
                return Err(err);
            }
        };
        self.back_range(start, count, area, owner)?;
        debug!("pgalloc_fixed {count} pages at {start}");
        Ok(())
    }

    fn back_range(
        &mut self,
        start: VirtualPage,
        count: u32,
        area: Area,
        owner: Option<&mut VmPageRegistry>,
    ) -> Result<(), RangeError> {
        let flags = match area {
            Area::Kernel => PageEntryBits::new_kernel_rw(),
            Area::User => PageEntryBits::new_user_rw(),
        };
        if let Err(err) = self.map_range(start, count, None, flags, owner) {
            warn!("backing {count} pages at {start} failed: {err}");
            self.ranges.insert(&self.platform, start, count);
            return Err(err.into());
        }
        Ok(())
    }

    /// Give back `[start, start + count)`.
    ///
    /// Mapped pages are unmapped and their frames freed; pages recorded in
    /// `owner` only free their frame with the last reference. Unmapped
    /// pages are skipped.
    pub fn pgfree(
        &mut self,
        start: VirtualPage,
        count: u32,
        mut owner: Option<&mut VmPageRegistry>,
    ) {
        let _irq = IrqGuard::new();
        self.ensure_spare_nodes();

        let space = AddressSpace::active(&self.platform);
        for page in start.pages(count) {
            let record = owner
                .as_deref_mut()
                .and_then(|registry| registry.remove(page));
            let mapped = space.unmap_one(page).ok();
            if mapped.is_some() {
                self.platform.invalidate_page(page);
            }
            match (record, mapped) {
                (Some(record), _) => {
                    if record.release() == 0 {
                        self.frames.free(record.physical_page());
                    }
                }
                (None, Some(frame)) => self.frames.free(frame),
                (None, None) => {}
            }
        }

        self.ranges.insert(&self.platform, start, count);
        debug!("pgfree {count} pages at {start}");
    }

    /// Whether `bit` is set in the entry of `page`.
    ///
    /// # Errors
    /// [`PageBitError::NotMapped`].
    pub fn get_page_bit(&self, page: VirtualPage, bit: PageBit) -> Result<bool, PageBitError> {
        AddressSpace::active(&self.platform)
            .entry(page)
            .map(|e| bit.is_set(e.flags()))
            .ok_or(PageBitError::NotMapped(page))
    }

    /// Set `bit` in the entry of `page`.
    ///
    /// # Errors
    /// [`PageBitError::NotMapped`].
    pub fn set_page_bit(&mut self, page: VirtualPage, bit: PageBit) -> Result<(), PageBitError> {
        self.apply_page_bit(page, bit, true)
    }

    /// Clear `bit` in the entry of `page`.
    ///
    /// # Errors
    /// [`PageBitError::NotMapped`].
    pub fn clear_page_bit(&mut self, page: VirtualPage, bit: PageBit) -> Result<(), PageBitError> {
        self.apply_page_bit(page, bit, false)
    }

    fn apply_page_bit(
        &mut self,
        page: VirtualPage,
        bit: PageBit,
        on: bool,
    ) -> Result<(), PageBitError> {
        let _irq = IrqGuard::new();
        AddressSpace::active(&self.platform)
            .update(page, |bits| bit.apply(bits, on))
            .ok_or(PageBitError::NotMapped(page))?;
        self.platform.invalidate_page(page);
        Ok(())
    }

    /// Rebuild a registry from the user entries of the active directory.
    ///
    /// Each present user page gets a fresh record (count 1) carrying the
    /// entry's current permissions.
    #[must_use]
    pub fn reconstruct_registry_from_live_tables(&self) -> VmPageRegistry {
        let _irq = IrqGuard::new();
        let space = AddressSpace::active(&self.platform);
        let mut registry = VmPageRegistry::new();
        for dir in DirIndex::user() {
            let Some(table) = space.table(dir) else {
                continue;
            };
            for (t, pte) in table.present() {
                let bits = pte.flags();
                if bits.user_access() {
                    registry.insert(VmPage::new(dir.page(t), bits.page(), bits));
                }
            }
        }
        registry
    }

    /// Tear down a process's memory: release every record (freeing frames
    /// that drop to zero references), then the user page tables and the
    /// directory itself.
    ///
    /// Frames mapped without a record are not freed.
    ///
    /// # Panics
    /// If `space` is the active address space.
    pub fn destroy_user_space(&mut self, space: UserSpace) {
        let _irq = IrqGuard::new();
        assert_ne!(
            space.directory(),
            self.platform.active_directory(),
            "cannot destroy the active address space"
        );

        let (directory, mut registry) = space.into_parts();
        let records = registry.len();
        for frame in registry.release_all() {
            self.frames.free(frame);
        }

        let window = self.open_window(0, directory);
        let pd: &mut PageDirectory = unsafe { self.platform.virt_to_mut(window.base()) };
        let tables: Vec<PhysicalPage> = DirIndex::user()
            .filter_map(|d| pd.get(d).table())
            .collect();
        self.close_window(0);

        for table in &tables {
            self.frames.free(*table);
        }
        self.frames.free(directory);
        debug!(
            "destroyed directory {directory}: {records} records, {} tables",
            tables.len()
        );
    }

    /// Print the used and free runs of `area`.
    pub fn log_ranges(&self, area: Area) {
        let bounds = self.ranges.bounds(area);
        let mut cursor = bounds.start;
        debug!("{area:?} area {}..{}:", bounds.start, bounds.end);
        for free in self.ranges.free_ranges(&self.platform, area) {
            if cursor < free.start {
                debug!("vm-used: {cursor} -> {}", free.start);
            }
            debug!("vm-free: {} -> {}", free.start, free.end);
            cursor = free.end;
        }
        if cursor < bounds.end {
            debug!("vm-used: {cursor} -> {}", bounds.end);
        }
    }

    /// Make sure the range node pool can serve a free, growing it by one
    /// kernel page if not.
    pub(crate) fn ensure_spare_nodes(&mut self) {
        if self.ranges.spare_nodes() >= MIN_SPARE_NODES {
            return;
        }
        let Some(page) = self.ranges.take(&self.platform, 1, Area::Kernel) else {
            error!("no kernel virtual memory left for range nodes");
            panic!("ran out of memory while allocating VM range structures");
        };
        let frame = self.frames.alloc();
        let space = AddressSpace::active(&self.platform);
        fatal_on_oom(space.map_one(&mut self.frames, page, frame, PageEntryBits::new_kernel_rw()));
        self.platform.invalidate_page(page);
        self.ranges.add_pool_page(&self.platform, page);
    }

    /// Map `frame` at transient window `slot`; returns the window page.
    pub(crate) fn open_window(&mut self, slot: usize, frame: PhysicalPage) -> VirtualPage {
        let page = self.windows[slot];
        let space = AddressSpace::active(&self.platform);
        // Kernel tables exist from bootstrap on, so no frame is needed here.
        fatal_on_oom(space.map_one(&mut self.frames, page, frame, PageEntryBits::new_kernel_rw()));
        self.platform.invalidate_page(page);
        page
    }

    pub(crate) fn close_window(&mut self, slot: usize) {
        let page = self.windows[slot];
        if AddressSpace::active(&self.platform).unmap_one(page).is_ok() {
            self.platform.invalidate_page(page);
        }
    }

    /// Copy the contents of frame `from` into frame `to`.
    pub(crate) fn copy_frame(&mut self, from: PhysicalPage, to: PhysicalPage) {
        let src = self.open_window(0, from);
        let dst = self.open_window(1, to);
        let src: &mut [u8; PAGE_SIZE as usize] = unsafe { self.platform.virt_to_mut(src.base()) };
        let dst: &mut [u8; PAGE_SIZE as usize] = unsafe { self.platform.virt_to_mut(dst.base()) };
        dst.copy_from_slice(src);
        self.close_window(1);
        self.close_window(0);
    }
}

//! Page fault resolution.
//!
//! Two kinds of fault are resolved, both only from user mode:
//!
//! - **Copy-on-write**: a write to a present page whose record says it is
//!   writable. If no other address space maps the record the page is made
//!   writable in place; otherwise the writer gets a private copy.
//! - **Stack growth**: an access to a missing page at most
//!   [`VmmConfig::stack_growth_max_pages`](crate::VmmConfig) below the stack
//!   boundary maps everything between the fault and the boundary.
//!
//! Everything else is fatal. [`Vmm::on_page_fault`] logs the diagnostic and
//! panics, which halts the kernel.

use crate::process::{FaultHandlerFn, InterruptRegistry, ProcessTable, ProcessVm, UserSpace};
use crate::range_alloc::{Area, RangeError};
use crate::vm_page::{VmPage, VmPageRegistry};
use crate::vmm::Vmm;
use alloc::rc::Rc;
use kernel_info::memory::PAGE_FAULT_VECTOR;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use kernel_sync::IrqGuard;
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageEntryBits, PageFault, PhysMapper};
use log::{debug, error, info, warn};
use thiserror::Error;

/// How a fault was resolved; the faulting instruction can be retried.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResolution {
    /// Sole owner of a copy-on-write page: write access restored in place.
    MadeWritable,
    /// Shared copy-on-write page: the writer now maps a private copy.
    Copied { frame: PhysicalPage },
    /// The user stack grew down by `pages`.
    StackGrown { pages: u32 },
}

/// Why a fault could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum FaultKind {
    #[error("fault in kernel mode")]
    KernelMode,
    #[error("reserved bit set")]
    ReservedBit,
    #[error("no current process")]
    NoProcess,
    #[error("protection violation")]
    ProtectionViolation,
    #[error("page not present")]
    NotPresent,
    #[error("stack growth failed")]
    StackGrowth,
    #[error("out of physical memory")]
    OutOfMemory,
}

/// An unresolvable page fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind}: {fault}")]
pub struct FatalPageFault {
    pub kind: FaultKind,
    pub fault: PageFault,
}

/// Route the page fault vector to `handler`.
///
/// `handler` is the kernel's glue: it finds the memory manager and the
/// process table and calls [`Vmm::on_page_fault`].
pub fn install_fault_handler<R: InterruptRegistry>(registry: &mut R, handler: FaultHandlerFn) {
    registry.register(PAGE_FAULT_VECTOR, handler);
    info!("page fault handler installed on vector {PAGE_FAULT_VECTOR}");
}

impl<P: PhysMapper + Mmu> Vmm<P> {
    /// Interrupt entry: resolve `fault` for the current process or halt.
    ///
    /// # Panics
    /// On every fault [`handle_page_fault`](Self::handle_page_fault) cannot
    /// resolve, after logging the fault address, the raw error bits, their
    /// classification and the page walk.
    pub fn on_page_fault<T: ProcessTable>(
        &mut self,
        processes: &mut T,
        fault: PageFault,
    ) -> FaultResolution {
        let current = processes.current_id();
        let process = current.and_then(|id| processes.get_mut(id));
        match self.handle_page_fault(process, fault) {
            Ok(resolution) => resolution,
            Err(fatal) => {
                error!("~~~~~ PAGE FAULT ~~~~~");
                error!("process: {current:?}");
                error!("{fatal}");
                error!("{}", AddressSpace::active(&self.platform).walk(fault.address));
                panic!("unhandled page fault at {}", fault.address);
            }
        }
    }

    /// Try to resolve `fault` raised by `process`, whose space is active.
    ///
    /// # Errors
    /// [`FatalPageFault`] for anything but a copy-on-write or stack growth
    /// fault from user mode. Nothing is allocated in that case.
    pub fn handle_page_fault(
        &mut self,
        process: Option<&mut ProcessVm>,
        fault: PageFault,
    ) -> Result<FaultResolution, FatalPageFault> {
        let _irq = IrqGuard::new();
        let fatal = |kind| FatalPageFault { kind, fault };
        let error = fault.error;

        if !error.user() {
            return Err(fatal(FaultKind::KernelMode));
        }
        if error.reserved_bit() {
            return Err(fatal(FaultKind::ReservedBit));
        }
        let Some(process) = process else {
            return Err(fatal(FaultKind::NoProcess));
        };
        debug_assert_eq!(process.space.directory(), self.platform.active_directory());

        let page = fault.address.page();
        if error.present() {
            if !error.write() {
                return Err(fatal(FaultKind::ProtectionViolation));
            }
            let record = process.space.registry().get(page).cloned();
            let Some(record) = record.filter(|r| r.flags().writable()) else {
                return Err(fatal(FaultKind::ProtectionViolation));
            };
            return self.resolve_cow(&mut process.space, &record).map_err(fatal);
        }

        let boundary = process.user_stack_boundary;
        if page >= boundary || boundary - page > self.config.stack_growth_max_pages {
            return Err(fatal(FaultKind::NotPresent));
        }

        let pages = boundary - page;
        if let Err(err) = self.grow_stack(page, pages, process.space.registry_mut()) {
            warn!("stack growth of process {} failed: {err}", process.id);
            return Err(fatal(FaultKind::StackGrowth));
        }
        process.user_stack_boundary = page;
        debug!("process {}: stack grew by {pages} pages to {page}", process.id);
        Ok(FaultResolution::StackGrown { pages })
    }

    /// Map `[start, start + pages)` into the active space.
    ///
    /// Forked processes inherit the same stack boundary, so the range may
    /// already be reserved by a relative. It is taken from the allocator if
    /// still free; either way it must not be mapped in this space yet.
    fn grow_stack(
        &mut self,
        start: VirtualPage,
        pages: u32,
        registry: &mut VmPageRegistry,
    ) -> Result<(), RangeError> {
        if self.ranges.check_range(start, pages)? != Area::User {
            return Err(RangeError::OutOfRange);
        }
        let space = AddressSpace::active(&self.platform);
        if start.pages(pages).any(|p| space.entry(p).is_some()) {
            return Err(RangeError::Unavailable);
        }

        self.ensure_spare_nodes();
        let reserved = self.ranges.take_fixed(&self.platform, start, pages).is_ok();
        let flags = PageEntryBits::new_user_rw();
        if let Err(err) = self.map_range(start, pages, None, flags, Some(registry)) {
            if reserved {
                self.ranges.insert(&self.platform, start, pages);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn resolve_cow(
        &mut self,
        space: &mut UserSpace,
        record: &Rc<VmPage>,
    ) -> Result<FaultResolution, FaultKind> {
        let page = record.virtual_page();
        if record.ref_count() == 1 {
            AddressSpace::active(&self.platform)
                .update(page, |bits| bits.with_writable(true))
                .ok_or(FaultKind::NotPresent)?;
            self.platform.invalidate_page(page);
            debug!("cow {page}: sole owner, writable in place");
            return Ok(FaultResolution::MadeWritable);
        }

        let frame = self.frames.alloc_frame().ok_or(FaultKind::OutOfMemory)?;
        self.copy_frame(record.physical_page(), frame);

        let space_tables = AddressSpace::active(&self.platform);
        if space_tables
            .map_one(&mut self.frames, page, frame, record.flags())
            .is_err()
        {
            self.frames.free(frame);
            return Err(FaultKind::OutOfMemory);
        }
        self.platform.invalidate_page(page);

        space
            .registry_mut()
            .insert(VmPage::new(page, frame, record.flags()));
        record.release();
        debug!(
            "cow {page}: copied {} -> {frame}, {} sharers left",
            record.physical_page(),
            record.ref_count()
        );
        Ok(FaultResolution::Copied { frame })
    }
}

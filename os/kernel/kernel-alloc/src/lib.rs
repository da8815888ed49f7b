//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frames, virtual ranges and process address spaces for a 32-bit
//! kernel with two-level paging, including copy-on-write fork and demand
//! stack growth.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (Vmm)         │
//! │    • map / unmap / translate / page bits            │
//! │    • pgalloc / pgalloc_fixed / pgfree               │
//! │    • clone_address_space / page faults / teardown   │
//! └───────┬─────────────────┬──────────────────┬────────┘
//!         │                 │                  │
//! ┌───────▼───────┐ ┌───────▼────────┐ ┌───────▼────────┐
//! │ Range         │ │ Frame bitmap   │ │ VmPage         │
//! │ free-lists    │ │ (1 bit/frame)  │ │ registries     │
//! │ kernel | user │ │                │ │ (per process)  │
//! └───────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//! * **Bitmap**: one bit per 4 KiB frame, storage provided by the caller
//! * **Boot Map**: built from the usable regions of the boot memory map,
//!   minus the kernel image and the bitmap itself
//! * **Fatal Exhaustion**: [`BitmapFrameAlloc::alloc`] halts when memory runs
//!   out; [`kernel_vmem::FrameAlloc`] offers the fallible path
//!
//! ### Virtual Range Allocator ([`range_alloc`])
//! * **Two Areas**: kernel and user free-lists split at `KMEM_START`
//! * **First Fit**, fixed-address requests, coalescing on free
//! * **Node Pool**: list nodes live in kernel pages sliced up on demand
//!
//! ### Page Records ([`vm_page`])
//! * **`VmPage`**: one shared, reference-counted record per user page
//! * **`VmPageRegistry`**: the ordered set of records of one process
//!
//! ### Virtual Memory Manager ([`vmm`], [`clone`], [`page_fault`])
//! * **Bootstrap**: first directory, recursive slot, paging on
//! * **Cloning**: per-process page tables, shared frames, optional COW
//! * **Faults**: copy-on-write and stack growth, anything else halts
//! * **Teardown**: frames and tables of an exited process
//!
//! ## Concurrency
//!
//! Single CPU. Every public [`Vmm`] operation disables interrupts for its
//! duration; nothing blocks.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let frames = BitmapFrameAlloc::new(bitmap, &boot, bitmap_phys);
//! let mut vmm = Vmm::bootstrap(X86Paging, frames, boot.kernel_image.clone(), VmmConfig::default());
//!
//! let mut init = ProcessVm::new(1, vmm.initial_space(), stack_top);
//! vmm.pgalloc_fixed(stack_top - 4, 4, Some(init.space.registry_mut()))?;
//!
//! let child = vmm.clone_address_space(&init.space, CloneMode::CopyOnWrite)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod clone;
pub mod frame_alloc;
pub mod page_fault;
pub mod process;
pub mod range_alloc;
pub mod vm_page;
pub mod vmm;

pub use crate::clone::CloneMode;
pub use crate::frame_alloc::BitmapFrameAlloc;
pub use crate::page_fault::{
    FatalPageFault, FaultKind, FaultResolution, install_fault_handler,
};
pub use crate::process::{
    FaultHandlerFn, InterruptRegistry, Pid, ProcessTable, ProcessVm, UserSpace,
};
pub use crate::range_alloc::{Area, RangeError, VirtualRangeAllocator};
pub use crate::vm_page::{VmPage, VmPageRegistry};
pub use crate::vmm::{PageBitError, Vmm, VmmConfig};

//! # Hardware backend
//!
//! [`X86Paging`] drives the real MMU. Paging structures are reached through
//! the recursive slot, so [`PhysMapper::virt_to_mut`] is a plain pointer
//! cast. Before paging is enabled, physical addresses are used directly.

use crate::{BootMapper, Mmu, PageFault, PageFaultError, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr2::Cr2;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// The i386 MMU of the executing CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct X86Paging;

impl PhysMapper for X86Paging {
    #[inline]
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}

impl BootMapper for X86Paging {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u32() as usize as *mut T) }
    }
}

impl Mmu for X86Paging {
    #[inline]
    fn active_directory(&self) -> PhysicalPage {
        unsafe { Cr3::load_unsafe() }.directory()
    }

    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage) {
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe()
                .with_pg_paging(true)
                .with_wp_write_protect(false);
            cr0.store_unsafe();
        }
    }

    #[inline]
    fn paging_enabled(&self) -> bool {
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }

    #[inline]
    fn invalidate_page(&self, page: VirtualPage) {
        let addr = page.base().as_u32();
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_tlb(&self) {
        unsafe { Cr3::load_unsafe().store_unsafe() }
    }
}

/// Build the fault record for the `#PF` being handled.
///
/// # Safety
/// Must be called from the page-fault handler before anything can fault
/// again and overwrite CR2.
#[must_use]
pub unsafe fn current_fault(error_code: u32) -> PageFault {
    let cr2 = unsafe { Cr2::load_unsafe() };
    PageFault::new(cr2.fault_address(), PageFaultError::from_bits(error_code))
}

#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAlloc, Vmm, VmmConfig};
use kernel_info::boot::{BootMemory, MemoryRegion};
use kernel_info::memory::PHYS_LOAD;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualPage};
use kernel_vmem::sim::SimMachine;

/// 16 MiB of simulated RAM.
pub const FRAMES: u32 = 4096;

/// Size of the simulated kernel image at `PHYS_LOAD`.
pub const IMAGE_SIZE: u32 = 0x4_0000;

pub fn image() -> core::ops::Range<PhysicalAddress> {
    PhysicalAddress::new(PHYS_LOAD)..PhysicalAddress::new(PHYS_LOAD + IMAGE_SIZE)
}

pub fn bitmap(frames: u32) -> &'static mut [u32] {
    Box::leak(vec![0u32; BitmapFrameAlloc::words_for(frames)].into_boxed_slice())
}

/// A booted memory manager over 16 MiB, everything but the image usable.
pub fn boot_with(config: VmmConfig) -> Vmm<SimMachine> {
    let regions = [MemoryRegion::usable(0, u64::from(FRAMES) * 4096)];
    let boot = BootMemory {
        regions: &regions,
        kernel_image: image(),
    };
    let frames = BitmapFrameAlloc::new(
        bitmap(FRAMES),
        &boot,
        PhysicalAddress::new(0)..PhysicalAddress::new(0),
    );
    Vmm::bootstrap(SimMachine::new(FRAMES), frames, image(), config)
}

pub fn boot() -> Vmm<SimMachine> {
    boot_with(VmmConfig::default())
}

pub fn page(addr: u32) -> VirtualPage {
    VirtualAddress::new(addr).page()
}

pub fn va(addr: u32) -> VirtualAddress {
    VirtualAddress::new(addr)
}

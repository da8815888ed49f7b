mod common;

use common::{IMAGE_SIZE, bitmap, image};
use kernel_alloc::BitmapFrameAlloc;
use kernel_info::boot::{BootMemory, MemoryRegion};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::FrameAlloc;
use std::collections::BTreeSet;

const MIB: u64 = 1 << 20;

#[test]
fn sixteen_mib_region_yields_every_frame_once() {
    // 16 MiB of usable frames plus the kernel image, which sits inside.
    let regions = [MemoryRegion::usable(0, 16 * MIB + u64::from(IMAGE_SIZE))];
    let boot = BootMemory {
        regions: &regions,
        kernel_image: image(),
    };
    let mut frames = BitmapFrameAlloc::new(
        bitmap(8192),
        &boot,
        PhysicalAddress::new(0)..PhysicalAddress::new(0),
    );
    assert_eq!(frames.free_count(), 4096);

    let kernel = image();
    let mut seen = BTreeSet::new();
    for _ in 0..4096 {
        let frame = frames.alloc();
        let base = frame.base();
        assert!(base.is_page_aligned());
        assert!(!kernel.contains(&base), "{frame:?} is in the image");
        assert!(seen.insert(frame), "{frame:?} handed out twice");
    }
    assert_eq!(seen.len(), 4096);
    assert_eq!(frames.alloc_frame(), None);

    // Everything comes back.
    for frame in seen {
        frames.free(frame);
    }
    assert_eq!(frames.free_count(), 4096);
}

#[test]
fn overlapping_regions_and_partial_frames() {
    let regions = [
        MemoryRegion::usable(0x1800, 0x4000),
        MemoryRegion::usable(0x3000, 0x4000),
        MemoryRegion::reserved(0x5000, 0x1000),
    ];
    let boot = BootMemory {
        regions: &regions,
        kernel_image: PhysicalAddress::new(0x6800)..PhysicalAddress::new(0x6900),
    };
    let frames = BitmapFrameAlloc::new(
        bitmap(64),
        &boot,
        PhysicalAddress::new(0)..PhysicalAddress::new(0),
    );

    // Usable whole frames 2..7, minus frame 6 under the image. A reserved
    // entry does not take back what another entry made usable.
    let free: Vec<u32> = (0..64)
        .filter(|&i| frames.is_free(kernel_memory_addresses::PhysicalPage::from_index(i)))
        .collect();
    assert_eq!(free, [2, 3, 4, 5]);
}

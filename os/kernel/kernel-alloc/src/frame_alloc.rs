//! Bitmap allocator for physical 4 KiB frames.
//!
//! One bit per frame, `1` = used. The bitmap storage is handed in by the
//! caller (a static in the kernel image, a leaked box in tests) so the
//! allocator itself never needs a heap.

use core::ops::Range;
use kernel_info::boot::BootMemory;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_vmem::FrameAlloc;
use log::{debug, error};

const BITS: usize = u32::BITS as usize;

/// Bitmap frame allocator.
///
/// ### Invariants
/// - No word before `hint` has a free bit.
/// - Bits past `frames` are permanently set.
/// - `free` equals the number of clear bits.
pub struct BitmapFrameAlloc {
    bitmap: &'static mut [u32],
    frames: u32,
    hint: usize,
    free: u32,
}

impl BitmapFrameAlloc {
    /// Number of bitmap words needed to describe `frames` frames.
    #[must_use]
    pub const fn words_for(frames: u32) -> usize {
        (frames as usize).div_ceil(BITS)
    }

    /// Build the allocator from the boot memory map.
    ///
    /// Every frame starts out used. Frames lying entirely inside a usable
    /// region are then released, and finally every frame overlapping the
    /// bitmap storage (`bitmap_phys`) or the kernel image is marked used
    /// again. Frames beyond what `bitmap` can describe stay unmanaged.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        bitmap: &'static mut [u32],
        boot: &BootMemory<'_>,
        bitmap_phys: Range<PhysicalAddress>,
    ) -> Self {
        bitmap.fill(u32::MAX);
        let frames = (bitmap.len() * BITS).min(1 << 20) as u32;
        let mut this = Self {
            bitmap,
            frames,
            hint: 0,
            free: 0,
        };

        for region in boot.regions.iter().filter(|r| r.usable) {
            let first = region.base.div_ceil(u64::from(PAGE_SIZE));
            let end = region.end() / u64::from(PAGE_SIZE);
            this.mark(first..end, false);
        }

        for used in [bitmap_phys, boot.kernel_image.clone()] {
            let first = u64::from(used.start.as_u32()) / u64::from(PAGE_SIZE);
            let end = u64::from(used.end.as_u32()).div_ceil(u64::from(PAGE_SIZE));
            this.mark(first..end, true);
        }

        debug!(
            "frame bitmap: {} of {} frames free",
            this.free, this.frames
        );
        this
    }

    /// Set or clear the bits of a frame range, clamped to the managed frames.
    #[allow(clippy::cast_possible_truncation)]
    fn mark(&mut self, frames: Range<u64>, used: bool) {
        let end = frames.end.min(u64::from(self.frames));
        for frame in frames.start..end {
            let frame = frame as usize;
            let (word, mask) = (frame / BITS, 1 << (frame % BITS));
            let was_used = self.bitmap[word] & mask != 0;
            match (was_used, used) {
                (true, false) => {
                    self.bitmap[word] &= !mask;
                    self.free += 1;
                }
                (false, true) => {
                    self.bitmap[word] |= mask;
                    self.free -= 1;
                }
                _ => {}
            }
        }
        self.hint = 0;
    }

    /// Allocate a frame; running out of physical memory is fatal.
    ///
    /// # Panics
    /// If no frame is free.
    pub fn alloc(&mut self) -> PhysicalPage {
        self.alloc_frame().unwrap_or_else(|| {
            error!("out of physical memory: all {} frames in use", self.frames);
            panic!("out of physical memory");
        })
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// If the frame is already free (double free) or not managed.
    pub fn free(&mut self, frame: PhysicalPage) {
        let index = frame.index() as usize;
        let (word, mask) = (index / BITS, 1 << (index % BITS));
        if frame.index() >= self.frames || self.bitmap[word] & mask == 0 {
            error!("double free of {frame:?}");
            panic!("double free of physical frame {frame}");
        }

        self.bitmap[word] &= !mask;
        self.free += 1;
        self.hint = self.hint.min(word);
    }

    /// Whether `frame` is currently free.
    #[must_use]
    pub fn is_free(&self, frame: PhysicalPage) -> bool {
        let index = frame.index() as usize;
        frame.index() < self.frames && self.bitmap[index / BITS] & (1 << (index % BITS)) == 0
    }

    /// Number of free frames.
    #[must_use]
    pub const fn free_count(&self) -> u32 {
        self.free
    }

    /// Number of frames the bitmap describes.
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frames
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    #[allow(clippy::cast_possible_truncation)]
    fn alloc_frame(&mut self) -> Option<PhysicalPage> {
        let offset = self.bitmap[self.hint..]
            .iter()
            .position(|&word| word != u32::MAX);
        let Some(offset) = offset else {
            self.hint = self.bitmap.len();
            return None;
        };

        let word = self.hint + offset;
        let bit = (!self.bitmap[word]).trailing_zeros() as usize;
        self.bitmap[word] |= 1 << bit;
        self.free -= 1;
        self.hint = word;
        Some(PhysicalPage::from_index((word * BITS + bit) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use kernel_info::boot::MemoryRegion;

    fn bitmap(frames: u32) -> &'static mut [u32] {
        Box::leak(vec![0u32; BitmapFrameAlloc::words_for(frames)].into_boxed_slice())
    }

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn only_whole_usable_frames_are_free() {
        let regions = [
            MemoryRegion::usable(0x1800, 0x3000), // frames 2..=3 complete
            MemoryRegion::reserved(0x10_0000, 0x1000),
        ];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0)..pa(0),
        };
        let frames = BitmapFrameAlloc::new(bitmap(64), &boot, pa(0)..pa(0));
        assert_eq!(frames.free_count(), 2);
        assert!(!frames.is_free(PhysicalPage::from_index(1)));
        assert!(frames.is_free(PhysicalPage::from_index(2)));
        assert!(frames.is_free(PhysicalPage::from_index(3)));
        assert!(!frames.is_free(PhysicalPage::from_index(4)));
    }

    #[test]
    fn bitmap_and_image_are_reserved() {
        let regions = [MemoryRegion::usable(0, 0x40_000)];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0x1_0000)..pa(0x1_2001),
        };
        let frames = BitmapFrameAlloc::new(bitmap(64), &boot, pa(0x3000)..pa(0x3010));
        assert!(!frames.is_free(PhysicalPage::from_index(3)));
        for i in 0x10..=0x12 {
            assert!(!frames.is_free(PhysicalPage::from_index(i)));
        }
        assert!(frames.is_free(PhysicalPage::from_index(0x13)));
        assert_eq!(frames.free_count(), 64 - 1 - 3);
    }

    #[test]
    fn regions_beyond_the_bitmap_are_ignored() {
        let regions = [MemoryRegion::usable(0, 1 << 33)];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0)..pa(0),
        };
        let frames = BitmapFrameAlloc::new(bitmap(40), &boot, pa(0)..pa(0));
        // 40 frames round up to two words.
        assert_eq!(frames.frame_count(), 64);
        assert_eq!(frames.free_count(), 64);
    }

    #[test]
    fn free_retreats_the_hint() {
        let regions = [MemoryRegion::usable(0, 0x10_0000)];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0)..pa(0),
        };
        let mut frames = BitmapFrameAlloc::new(bitmap(256), &boot, pa(0)..pa(0));

        let taken: alloc::vec::Vec<_> = (0..100).map(|_| frames.alloc()).collect();
        assert_eq!(taken[0].index(), 0);
        assert_eq!(taken[99].index(), 99);

        frames.free(taken[3]);
        assert_eq!(frames.alloc().index(), 3);
        assert_eq!(frames.alloc().index(), 100);
    }

    #[test]
    fn exhaustion_is_reported_by_alloc_frame() {
        let regions = [MemoryRegion::usable(0, 0x2000)];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0)..pa(0),
        };
        let mut frames = BitmapFrameAlloc::new(bitmap(32), &boot, pa(0)..pa(0));
        assert!(frames.alloc_frame().is_some());
        assert!(frames.alloc_frame().is_some());
        assert_eq!(frames.alloc_frame(), None);

        frames.free(PhysicalPage::from_index(0));
        assert_eq!(frames.alloc_frame(), Some(PhysicalPage::from_index(0)));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let regions = [MemoryRegion::usable(0, 0x2000)];
        let boot = BootMemory {
            regions: &regions,
            kernel_image: pa(0)..pa(0),
        };
        let mut frames = BitmapFrameAlloc::new(bitmap(32), &boot, pa(0)..pa(0));
        let f = frames.alloc();
        frames.free(f);
        frames.free(f);
    }

    #[test]
    #[should_panic(expected = "out of physical memory")]
    fn exhausting_alloc_is_fatal() {
        let boot = BootMemory {
            regions: &[],
            kernel_image: pa(0)..pa(0),
        };
        let mut frames = BitmapFrameAlloc::new(bitmap(32), &boot, pa(0)..pa(0));
        let _ = frames.alloc();
    }
}

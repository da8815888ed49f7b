//! First-fit free-list allocator over virtual page ranges.
//!
//! Two lists, one per [`Area`], each sorted by address and fully coalesced:
//!
//! ```text
//! user:   [0x400..0x800) → [0x900..0xC0000)
//! kernel: [0xC0003..0xFFC00)
//! ```
//!
//! List nodes live in kernel pages of their own (the node pool), reached
//! through [`PhysMapper::virt_to_mut`] like any other kernel memory. Links
//! are virtual addresses of the next node, `0` ends a list. The pool only
//! grows, one page at a time, and growing it is the caller's job (it needs
//! a kernel range and a frame): see [`VirtualRangeAllocator::spare_nodes`]
//! and [`VirtualRangeAllocator::add_pool_page`].

use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};
use kernel_vmem::{MapError, PhysMapper};
use log::{error, trace};
use thiserror::Error;

/// The two halves of the virtual address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Area {
    Kernel,
    User,
}

impl Area {
    const fn slot(self) -> usize {
        match self {
            Self::Kernel => 0,
            Self::User => 1,
        }
    }
}

/// Failure of a range request.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RangeError {
    #[error("invalid range request crossing user/kernel split")]
    CrossesSplit,
    #[error("requested range is not free")]
    Unavailable,
    #[error("requested range is outside the managed areas")]
    OutOfRange,
    #[error("no free range is large enough")]
    Exhausted,
    #[error("failed to back the range: {0}")]
    Backing(#[from] MapError),
}

/// One free run `[start, end)` of page numbers.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct RangeNode {
    start: u32,
    end: u32,
    /// Address of the next node, [`NIL`] at the end.
    next: u32,
}

const NIL: u32 = 0;

/// How many nodes one pool page holds.
#[allow(clippy::cast_possible_truncation)]
pub const NODES_PER_PAGE: u32 = PAGE_SIZE / size_of::<RangeNode>() as u32;

/// Free-lists of the kernel and user areas plus the node pool.
pub struct VirtualRangeAllocator {
    heads: [u32; 2],
    areas: [Range<VirtualPage>; 2],
    pool: u32,
    spare: u32,
}

impl VirtualRangeAllocator {
    /// Seed both areas as entirely free.
    ///
    /// `seed` is a mapped, writable kernel page outside both areas; it
    /// becomes the first page of the node pool.
    ///
    /// # Panics
    /// If the areas overlap.
    pub fn new<M: PhysMapper>(
        m: &M,
        seed: VirtualPage,
        kernel: Range<VirtualPage>,
        user: Range<VirtualPage>,
    ) -> Self {
        assert!(
            user.end <= kernel.start || kernel.end <= user.start,
            "kernel and user areas overlap"
        );

        let mut this = Self {
            heads: [NIL; 2],
            areas: [kernel.clone(), user.clone()],
            pool: NIL,
            spare: 0,
        };
        this.add_pool_page(m, seed);
        this.insert(m, kernel.start, kernel.end - kernel.start);
        this.insert(m, user.start, user.end - user.start);
        this
    }

    /// Bounds of `area`.
    #[must_use]
    pub fn bounds(&self, area: Area) -> Range<VirtualPage> {
        self.areas[area.slot()].clone()
    }

    /// The area `page` belongs to, if any.
    #[must_use]
    pub fn area_of(&self, page: VirtualPage) -> Option<Area> {
        [Area::Kernel, Area::User]
            .into_iter()
            .find(|a| self.areas[a.slot()].contains(&page))
    }

    /// Nodes left in the pool.
    #[must_use]
    pub const fn spare_nodes(&self) -> u32 {
        self.spare
    }

    /// Slice the mapped kernel page `page` into pool nodes.
    pub fn add_pool_page<M: PhysMapper>(&mut self, m: &M, page: VirtualPage) {
        #[allow(clippy::cast_possible_truncation)]
        let size = size_of::<RangeNode>() as u32;
        for i in (0..NODES_PER_PAGE).rev() {
            self.release_node(m, page.base().as_u32() + i * size);
        }
        trace!("range node pool grew by {NODES_PER_PAGE} at {page}");
    }

    /// First fit: take `count` pages from the front of the first run that
    /// is large enough.
    pub fn take<M: PhysMapper>(&mut self, m: &M, count: u32, area: Area) -> Option<VirtualPage> {
        debug_assert!(count > 0);

        let mut prev = NIL;
        let mut at = self.heads[area.slot()];
        while at != NIL {
            let n = node(m, at);
            if n.end - n.start >= count {
                let start = VirtualPage::from_index(n.start);
                n.start += count;
                if n.start == n.end {
                    let next = n.next;
                    self.link(m, area, prev, next);
                    self.release_node(m, at);
                }
                return Some(start);
            }
            prev = at;
            at = n.next;
        }
        None
    }

    /// Take exactly `[start, start + count)`; returns the area it came from.
    ///
    /// # Errors
    /// - [`RangeError::CrossesSplit`] if the range straddles the two areas.
    /// - [`RangeError::OutOfRange`] if it is not inside one area.
    /// - [`RangeError::Unavailable`] if any page of it is in use.
    ///
    /// # Panics
    /// If splitting a run needs a node and the pool is empty.
    pub fn take_fixed<M: PhysMapper>(
        &mut self,
        m: &M,
        start: VirtualPage,
        count: u32,
    ) -> Result<Area, RangeError> {
        let area = self.check_range(start, count)?;
        let (lo, hi) = (start.index(), start.index() + count);

        let mut prev = NIL;
        let mut at = self.heads[area.slot()];
        while at != NIL {
            let n = node(m, at);
            if n.start > lo {
                break;
            }
            if hi <= n.end {
                match (n.start == lo, n.end == hi) {
                    (true, true) => {
                        let next = n.next;
                        self.link(m, area, prev, next);
                        self.release_node(m, at);
                    }
                    (true, false) => n.start = hi,
                    (false, true) => n.end = lo,
                    (false, false) => {
                        let (old_end, old_next) = (n.end, n.next);
                        n.end = lo;
                        let tail = self.alloc_node(m);
                        *node(m, tail) = RangeNode {
                            start: hi,
                            end: old_end,
                            next: old_next,
                        };
                        node(m, at).next = tail;
                    }
                }
                return Ok(area);
            }
            prev = at;
            at = n.next;
        }
        Err(RangeError::Unavailable)
    }

    /// Whether `[start, start + count)` may be requested as a fixed range.
    ///
    /// # Errors
    /// See [`take_fixed`](Self::take_fixed).
    pub fn check_range(&self, start: VirtualPage, count: u32) -> Result<Area, RangeError> {
        let end = start
            .index()
            .checked_add(count)
            .ok_or(RangeError::OutOfRange)?;
        let split = self.areas[Area::User.slot()].end.index();
        if start.index() < split && end > split {
            return Err(RangeError::CrossesSplit);
        }
        let area = self.area_of(start).ok_or(RangeError::OutOfRange)?;
        if count == 0 || end > self.areas[area.slot()].end.index() {
            return Err(RangeError::OutOfRange);
        }
        Ok(area)
    }

    /// Return `[start, start + count)` to the free-lists.
    ///
    /// A range straddling the split is returned to each area separately;
    /// runs are coalesced with their neighbours but never across areas.
    ///
    /// # Panics
    /// If part of the range is already free, lies outside both areas, or a
    /// node is needed and the pool is empty.
    pub fn insert<M: PhysMapper>(&mut self, m: &M, start: VirtualPage, count: u32) {
        let (mut lo, hi) = (start.index(), start.index() + count);
        while lo < hi {
            let Some(area) = self.area_of(VirtualPage::from_index(lo)) else {
                error!("freeing {lo:#x} outside the managed areas");
                panic!("invalid range free");
            };
            let part_end = hi.min(self.areas[area.slot()].end.index());
            self.insert_in(m, area, lo, part_end);
            lo = part_end;
        }
    }

    fn insert_in<M: PhysMapper>(&mut self, m: &M, area: Area, lo: u32, hi: u32) {
        let mut prev = NIL;
        let mut next = self.heads[area.slot()];
        while next != NIL && node(m, next).end <= lo {
            prev = next;
            next = node(m, next).next;
        }
        if next != NIL && node(m, next).start < hi {
            error!("range {lo:#x}..{hi:#x} overlaps a free run");
            panic!("range is already free");
        }

        let joins_prev = prev != NIL && node(m, prev).end == lo;
        let joins_next = next != NIL && node(m, next).start == hi;
        match (joins_prev, joins_next) {
            (true, true) => {
                let n = *node(m, next);
                let p = node(m, prev);
                p.end = n.end;
                p.next = n.next;
                self.release_node(m, next);
            }
            (true, false) => node(m, prev).end = hi,
            (false, true) => node(m, next).start = lo,
            (false, false) => {
                let at = self.alloc_node(m);
                *node(m, at) = RangeNode {
                    start: lo,
                    end: hi,
                    next,
                };
                self.link(m, area, prev, at);
            }
        }
    }

    /// Free runs of `area`, in address order.
    #[must_use]
    pub fn free_ranges<M: PhysMapper>(&self, m: &M, area: Area) -> Vec<Range<VirtualPage>> {
        let mut out = Vec::new();
        let mut at = self.heads[area.slot()];
        while at != NIL {
            let n = *node(m, at);
            out.push(VirtualPage::from_index(n.start)..VirtualPage::from_index(n.end));
            at = n.next;
        }
        out
    }

    /// Point `prev.next` (or the list head) at `to`.
    fn link<M: PhysMapper>(&mut self, m: &M, area: Area, prev: u32, to: u32) {
        if prev == NIL {
            self.heads[area.slot()] = to;
        } else {
            node(m, prev).next = to;
        }
    }

    fn alloc_node<M: PhysMapper>(&mut self, m: &M) -> u32 {
        if self.pool == NIL {
            error!("range node pool is empty");
            panic!("ran out of memory while allocating VM range structures");
        }
        let at = self.pool;
        self.pool = node(m, at).next;
        self.spare -= 1;
        at
    }

    fn release_node<M: PhysMapper>(&mut self, m: &M, at: u32) {
        *node(m, at) = RangeNode {
            start: 0,
            end: 0,
            next: self.pool,
        };
        self.pool = at;
        self.spare += 1;
    }
}

/// Borrow the node at `at`.
fn node<'a, M: PhysMapper>(m: &M, at: u32) -> &'a mut RangeNode {
    debug_assert_ne!(at, NIL);
    // Nodes only ever live in mapped pool pages handed to `add_pool_page`.
    unsafe { m.virt_to_mut(VirtualAddress::new(at)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::SimMachine;
    use kernel_vmem::{BootMapper, Mmu, PageDirectory, PageEntryBits, PageTable, PdEntry, PtEntry};
    use kernel_vmem::{DirIndex, TableIndex};

    const POOL: u32 = 0xC000_0000;

    /// Paging on, with page `POOL` mapped to frame 3.
    fn machine() -> SimMachine {
        let sim = SimMachine::new(8);
        let dir = kernel_memory_addresses::PhysicalPage::from_index(1);
        let table = kernel_memory_addresses::PhysicalPage::from_index(2);
        let frame = kernel_memory_addresses::PhysicalPage::from_index(3);
        unsafe {
            let pd: &mut PageDirectory = sim.phys_to_mut(dir.base());
            let flags = PageEntryBits::new_kernel_rw();
            pd.set(DirIndex::RECURSIVE, PdEntry::make_table(dir, flags));
            pd.set(DirIndex::new(768), PdEntry::make_table(table, flags));
            let pt: &mut PageTable = sim.phys_to_mut(table.base());
            pt.set(TableIndex::new(0), PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw()));
            sim.load_directory(dir);
            sim.enable_paging();
        }
        sim
    }

    fn vp(i: u32) -> VirtualPage {
        VirtualPage::from_index(i)
    }

    fn ranges(sim: &SimMachine, r: &VirtualRangeAllocator, area: Area) -> Vec<(u32, u32)> {
        r.free_ranges(sim, area)
            .into_iter()
            .map(|r| (r.start.index(), r.end.index()))
            .collect()
    }

    fn allocator(sim: &SimMachine) -> VirtualRangeAllocator {
        VirtualRangeAllocator::new(
            sim,
            VirtualPage::containing_address(VirtualAddress::new(POOL)),
            vp(0xC0001)..vp(0xFFC00),
            vp(0x400)..vp(0xC0000),
        )
    }

    #[test]
    fn seeded_with_both_areas() {
        let sim = machine();
        let r = allocator(&sim);
        assert_eq!(ranges(&sim, &r, Area::Kernel), [(0xC0001, 0xFFC00)]);
        assert_eq!(ranges(&sim, &r, Area::User), [(0x400, 0xC0000)]);
        assert_eq!(r.spare_nodes(), NODES_PER_PAGE - 2);
    }

    #[test]
    fn first_fit_shrinks_from_the_front() {
        let sim = machine();
        let mut r = allocator(&sim);
        assert_eq!(r.take(&sim, 4, Area::User), Some(vp(0x400)));
        assert_eq!(r.take(&sim, 1, Area::User), Some(vp(0x404)));
        assert_eq!(ranges(&sim, &r, Area::User), [(0x405, 0xC0000)]);
        assert_eq!(r.take(&sim, 0x10_0000, Area::User), None);
    }

    #[test]
    fn exhausted_runs_are_unlinked() {
        let sim = machine();
        let mut r = allocator(&sim);
        r.take_fixed(&sim, vp(0x402), 0xC0000 - 0x402).unwrap();
        assert_eq!(ranges(&sim, &r, Area::User), [(0x400, 0x402)]);

        let spare = r.spare_nodes();
        assert_eq!(r.take(&sim, 2, Area::User), Some(vp(0x400)));
        assert!(ranges(&sim, &r, Area::User).is_empty());
        assert_eq!(r.spare_nodes(), spare + 1);
    }

    #[test]
    fn fixed_take_splits_interior_runs() {
        let sim = machine();
        let mut r = allocator(&sim);
        r.take_fixed(&sim, vp(0x800), 0x10).unwrap();
        assert_eq!(
            ranges(&sim, &r, Area::User),
            [(0x400, 0x800), (0x810, 0xC0000)]
        );
        assert_eq!(
            r.take_fixed(&sim, vp(0x805), 1),
            Err(RangeError::Unavailable)
        );
        r.take_fixed(&sim, vp(0x400), 0x400).unwrap();
        assert_eq!(ranges(&sim, &r, Area::User), [(0x810, 0xC0000)]);
    }

    #[test]
    fn fixed_take_rejects_bad_requests() {
        let sim = machine();
        let mut r = allocator(&sim);
        assert_eq!(
            r.take_fixed(&sim, vp(0xBFFFF), 2),
            Err(RangeError::CrossesSplit)
        );
        assert_eq!(r.take_fixed(&sim, vp(0x10), 1), Err(RangeError::OutOfRange));
        assert_eq!(
            r.take_fixed(&sim, vp(0xFFBFF), 2),
            Err(RangeError::OutOfRange)
        );
    }

    #[test]
    fn freeing_coalesces_in_either_order() {
        let sim = machine();
        for order in [[0usize, 1, 2], [2, 1, 0], [0, 2, 1], [1, 0, 2]] {
            let mut r = allocator(&sim);
            let runs = [
                r.take(&sim, 3, Area::User).unwrap(),
                r.take(&sim, 3, Area::User).unwrap(),
                r.take(&sim, 3, Area::User).unwrap(),
            ];
            for i in order {
                r.insert(&sim, runs[i], 3);
            }
            assert_eq!(
                ranges(&sim, &r, Area::User),
                [(0x400, 0xC0000)],
                "{order:?}"
            );
            assert_eq!(r.spare_nodes(), NODES_PER_PAGE - 2);
        }
    }

    #[test]
    fn never_coalesces_across_the_split() {
        let sim = machine();
        let mut r = VirtualRangeAllocator::new(
            &sim,
            VirtualPage::containing_address(VirtualAddress::new(POOL)),
            vp(0xC0000)..vp(0xC0100),
            vp(0xBFF00)..vp(0xC0000),
        );
        r.take_fixed(&sim, vp(0xBFFF0), 0x10).unwrap();
        r.take_fixed(&sim, vp(0xC0000), 0x10).unwrap();

        r.insert(&sim, vp(0xBFFF0), 0x20);
        assert_eq!(ranges(&sim, &r, Area::User), [(0xBFF00, 0xC0000)]);
        assert_eq!(ranges(&sim, &r, Area::Kernel), [(0xC0000, 0xC0100)]);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_insert_is_fatal() {
        let sim = machine();
        let mut r = allocator(&sim);
        let start = r.take(&sim, 2, Area::User).unwrap();
        r.insert(&sim, start, 2);
        r.insert(&sim, start, 1);
    }

    #[test]
    fn nodes_live_in_the_pool_page() {
        let sim = machine();
        let mut r = allocator(&sim);
        r.take_fixed(&sim, vp(0x800), 1).unwrap();
        // The split run's tail node sits in frame 3, right after the seeds.
        let frame3 = kernel_memory_addresses::PhysicalPage::from_index(3).base();
        let words: Vec<u32> = (0..3 * 3)
            .map(|i| {
                let at = frame3 + i * 4;
                u32::from_le_bytes(core::array::from_fn(|b| sim.phys_u8(at + b as u32)))
            })
            .collect();
        assert!(words.contains(&0x801));
    }
}

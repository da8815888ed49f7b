//! Per-process records of user mappings.
//!
//! A [`VmPage`] describes one user page: where it lives, the permissions the
//! process asked for and how many address spaces map it through this very
//! record. Forking shares the record between parent and child; a
//! copy-on-write fault replaces it in the writer's registry only.
//!
//! `flags` are the *logical* permissions. A copy-on-write share clears the
//! writable bit in the page tables but never in the record, which is how
//! the fault handler tells a COW fault from a real protection violation.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::Cell;
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use kernel_vmem::PageEntryBits;

/// One user page mapping, shared by every address space that maps it.
pub struct VmPage {
    virtual_page: VirtualPage,
    physical_page: Cell<PhysicalPage>,
    flags: Cell<PageEntryBits>,
    ref_count: Cell<u32>,
}

impl VmPage {
    /// A record mapped by exactly one address space.
    #[must_use]
    pub fn new(
        virtual_page: VirtualPage,
        physical_page: PhysicalPage,
        flags: PageEntryBits,
    ) -> Rc<Self> {
        Rc::new(Self {
            virtual_page,
            physical_page: Cell::new(physical_page),
            flags: Cell::new(flags.attributes()),
            ref_count: Cell::new(1),
        })
    }

    #[must_use]
    pub const fn virtual_page(&self) -> VirtualPage {
        self.virtual_page
    }

    #[must_use]
    pub fn physical_page(&self) -> PhysicalPage {
        self.physical_page.get()
    }

    /// Repoint the record; the flags are left alone.
    pub fn set_physical_page(&self, frame: PhysicalPage) {
        self.physical_page.set(frame);
    }

    #[must_use]
    pub fn flags(&self) -> PageEntryBits {
        self.flags.get()
    }

    /// Number of address spaces mapping through this record.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.get()
    }

    /// One more address space maps through this record.
    pub fn acquire(&self) {
        self.ref_count.set(self.ref_count.get() + 1);
    }

    /// One address space stopped mapping through this record.
    ///
    /// Returns the remaining count; at zero the caller owns the frame.
    ///
    /// # Panics
    /// If the count is already zero.
    pub fn release(&self) -> u32 {
        let Some(left) = self.ref_count.get().checked_sub(1) else {
            panic!("{self:?} released more often than acquired");
        };
        self.ref_count.set(left);
        left
    }
}

impl fmt::Debug for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPage")
            .field("virtual_page", &self.virtual_page)
            .field("physical_page", &self.physical_page.get())
            .field("writable", &self.flags.get().writable())
            .field("ref_count", &self.ref_count.get())
            .finish()
    }
}

/// The user pages of one process, ordered by page number.
#[derive(Default)]
pub struct VmPageRegistry {
    pages: BTreeMap<VirtualPage, Rc<VmPage>>,
}

impl VmPageRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Insert `page`, returning the record it replaced.
    pub fn insert(&mut self, page: Rc<VmPage>) -> Option<Rc<VmPage>> {
        self.pages.insert(page.virtual_page(), page)
    }

    #[must_use]
    pub fn get(&self, page: VirtualPage) -> Option<&Rc<VmPage>> {
        self.pages.get(&page)
    }

    pub fn remove(&mut self, page: VirtualPage) -> Option<Rc<VmPage>> {
        self.pages.remove(&page)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<VmPage>> {
        self.pages.values()
    }

    /// A registry holding the same records, each acquired once more.
    #[must_use]
    pub fn share(&self) -> Self {
        let pages = self
            .pages
            .iter()
            .map(|(&vp, page)| {
                page.acquire();
                (vp, Rc::clone(page))
            })
            .collect();
        Self { pages }
    }

    /// Empty the registry, releasing every record once.
    ///
    /// Returns the frames whose last reference went away.
    pub fn release_all(&mut self) -> impl Iterator<Item = PhysicalPage> {
        core::mem::take(&mut self.pages)
            .into_values()
            .filter_map(|page| (page.release() == 0).then(|| page.physical_page()))
    }
}

impl fmt::Debug for VmPageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pages.values()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn page(vp: u32, frame: u32) -> Rc<VmPage> {
        VmPage::new(
            VirtualPage::from_index(vp),
            PhysicalPage::from_index(frame),
            PageEntryBits::new_user_rw(),
        )
    }

    #[test]
    fn ordered_by_page() {
        let mut reg = VmPageRegistry::new();
        reg.insert(page(0x500, 1));
        reg.insert(page(0x401, 2));
        reg.insert(page(0x402, 3));
        let order: Vec<_> = reg.iter().map(|p| p.virtual_page().index()).collect();
        assert_eq!(order, [0x401, 0x402, 0x500]);
        assert_eq!(
            reg.remove(VirtualPage::from_index(0x402))
                .map(|p| p.physical_page().index()),
            Some(3)
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn sharing_acquires_each_record() {
        let mut parent = VmPageRegistry::new();
        parent.insert(page(0x400, 7));
        let child = parent.share();

        let a = parent.get(VirtualPage::from_index(0x400)).unwrap();
        let b = child.get(VirtualPage::from_index(0x400)).unwrap();
        assert!(Rc::ptr_eq(a, b));
        assert_eq!(a.ref_count(), 2);
    }

    #[test]
    fn frames_are_returned_once() {
        let mut parent = VmPageRegistry::new();
        parent.insert(page(0x400, 7));
        let mut child = parent.share();

        assert_eq!(child.release_all().count(), 0);
        let freed: Vec<_> = parent.release_all().collect();
        assert_eq!(freed, [PhysicalPage::from_index(7)]);
        assert!(parent.is_empty() && child.is_empty());
    }

    #[test]
    fn flags_keep_attributes_only() {
        let p = page(0x400, 9);
        assert_eq!(p.flags().page(), PhysicalPage::from_index(0));
        assert!(p.flags().writable() && p.flags().user_access());
        p.set_physical_page(PhysicalPage::from_index(10));
        assert!(p.flags().writable());
    }

    #[test]
    #[should_panic(expected = "released more often")]
    fn over_release_panics() {
        let p = page(0x400, 9);
        p.release();
        p.release();
    }
}

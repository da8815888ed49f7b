//! Forking an address space.
//!
//! The child gets a fresh directory. Every present user slot gets its own
//! copy of the parent's page table (so later edits stay private), while
//! the low identity map and all kernel slots are copied by value and the
//! recursive slot points at the child's own directory. The frames behind
//! user pages are shared, accounted for by the records in the registry.
//!
//! Both directories are reached through the transient windows: the child's
//! directory in window 0, each new table in window 1.

use crate::process::UserSpace;
use crate::vmm::Vmm;
use kernel_memory_addresses::PhysicalPage;
use kernel_sync::IrqGuard;
use kernel_vmem::{
    AddressSpace, DirIndex, FrameAlloc, MapError, Mmu, PageDirectory, PageEntryBits, PageTable,
    PdEntry, PhysMapper,
};
use log::{debug, warn};

/// How user pages are shared with the child.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneMode {
    /// Write-protect every user page in both spaces; the first write
    /// copies the page (see [`Vmm::handle_page_fault`]).
    CopyOnWrite,

    /// Share the frames writable. Writes are seen by both processes;
    /// reference counts still go up so teardown frees each frame once.
    Shared,
}

impl<P: PhysMapper + Mmu> Vmm<P> {
    /// Build a child address space from `parent`, which must be active.
    ///
    /// With [`CloneMode::CopyOnWrite`] the parent's user pages become
    /// read-only and the whole TLB is flushed once at the end.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if frames for the directory or a table run
    /// out; everything allocated for the child is freed again.
    pub fn clone_address_space(
        &mut self,
        parent: &UserSpace,
        mode: CloneMode,
    ) -> Result<UserSpace, MapError> {
        let _irq = IrqGuard::new();
        debug_assert_eq!(
            parent.directory(),
            self.platform.active_directory(),
            "only the active address space can be cloned"
        );
        let cow = mode == CloneMode::CopyOnWrite;

        let child = self.frames.alloc_frame().ok_or(MapError::OutOfMemory)?;
        let window = self.open_window(0, child);
        let child_pd: &mut PageDirectory = unsafe { self.platform.virt_to_mut(window.base()) };
        child_pd.zero();

        let mut tables = 0;
        for dir in DirIndex::all() {
            let pde = AddressSpace::active(&self.platform).directory().get(dir);
            if dir == DirIndex::RECURSIVE {
                child_pd.set(dir, PdEntry::make_table(child, PageEntryBits::new_kernel_rw()));
                continue;
            }
            if !dir.is_user() {
                child_pd.set(dir, pde);
                continue;
            }
            if !pde.is_present() {
                continue;
            }

            let parent_table = unsafe { self.platform.table_mut(dir) };
            if cow {
                parent_table.write_protect_all();
            }

            let Some(copy) = self.frames.alloc_frame() else {
                warn!("clone: out of frames after {tables} tables");
                self.discard_child(child_pd, child, cow);
                return Err(MapError::OutOfMemory);
            };
            let window = self.open_window(1, copy);
            let table: &mut PageTable = unsafe { self.platform.virt_to_mut(window.base()) };
            table.copy_from(parent_table);
            child_pd.set(dir, PdEntry::make_table(copy, pde.flags().attributes()));
            tables += 1;
        }

        self.close_window(1);
        self.close_window(0);

        let registry = parent.registry().share();
        if cow {
            self.platform.flush_tlb();
        }
        debug!(
            "cloned {} into {child} ({mode:?}): {tables} tables, {} shared pages",
            parent.directory(),
            registry.len()
        );
        Ok(UserSpace::with_registry(child, registry))
    }

    /// Undo a partially built child.
    fn discard_child(&mut self, child_pd: &PageDirectory, child: PhysicalPage, cow: bool) {
        for table in DirIndex::user().filter_map(|d| child_pd.get(d).table()) {
            self.frames.free(table);
        }
        self.close_window(1);
        self.close_window(0);
        self.frames.free(child);
        if cow {
            // The parent was write-protected already.
            self.platform.flush_tlb();
        }
    }
}

//! What memory management knows about processes, and what it needs from
//! the rest of the kernel.

use crate::vm_page::VmPageRegistry;
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use kernel_vmem::PageFault;

/// Process identifier as handed out by the scheduler.
pub type Pid = u32;

/// The memory of one process: its page directory and its user pages.
#[derive(Debug)]
pub struct UserSpace {
    directory: PhysicalPage,
    registry: VmPageRegistry,
}

impl UserSpace {
    /// A space around an existing directory, with no user pages recorded.
    #[must_use]
    pub const fn new(directory: PhysicalPage) -> Self {
        Self::with_registry(directory, VmPageRegistry::new())
    }

    #[must_use]
    pub const fn with_registry(directory: PhysicalPage, registry: VmPageRegistry) -> Self {
        Self {
            directory,
            registry,
        }
    }

    /// Frame of the page directory (the CR3 value).
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        self.directory
    }

    #[must_use]
    pub const fn registry(&self) -> &VmPageRegistry {
        &self.registry
    }

    pub const fn registry_mut(&mut self) -> &mut VmPageRegistry {
        &mut self.registry
    }

    pub(crate) fn into_parts(self) -> (PhysicalPage, VmPageRegistry) {
        (self.directory, self.registry)
    }
}

/// The memory-management view of a process.
#[derive(Debug)]
pub struct ProcessVm {
    pub id: Pid,
    pub space: UserSpace,

    /// Lowest page of the user stack. Faults shortly below it grow the stack.
    pub user_stack_boundary: VirtualPage,
}

impl ProcessVm {
    #[must_use]
    pub const fn new(id: Pid, space: UserSpace, user_stack_boundary: VirtualPage) -> Self {
        Self {
            id,
            space,
            user_stack_boundary,
        }
    }
}

/// Process lookup, provided by the scheduler.
pub trait ProcessTable {
    /// The process that was running when the interrupt arrived.
    fn current_id(&self) -> Option<Pid>;

    fn get_mut(&mut self, id: Pid) -> Option<&mut ProcessVm>;
}

/// Signature of a page fault entry point.
pub type FaultHandlerFn = fn(PageFault);

/// Interrupt vector registration, provided by the interrupt layer.
pub trait InterruptRegistry {
    /// Route exception `vector` to `handler`.
    fn register(&mut self, vector: u8, handler: FaultHandlerFn);
}

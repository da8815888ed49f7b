//! # Memory Layout

/// Start of kernel space; everything below belongs to the current process.
///
/// This is also the split between the kernel and user free-lists of the
/// virtual range allocator.
pub const KMEM_START: u32 = 0xC000_0000;

/// First virtual address handed out to user space.
///
/// The first 4 MiB hold the supervisor-only identity map of the kernel image.
pub const USER_MEM_START: u32 = 0x0040_0000;

/// Directory slot that points back at the directory itself.
pub const RECURSIVE_SLOT: u32 = 1023;

/// First directory slot covering user space.
pub const USER_DIR_START: u32 = USER_MEM_START >> 22;

/// First directory slot covering kernel space.
pub const KERNEL_DIR_START: u32 = KMEM_START >> 22;

/// Virtual base of the recursive page table window.
///
/// Page table `i` is visible at `PGTBL_BASE + i * 4096`.
pub const PGTBL_BASE: u32 = RECURSIVE_SLOT << 22;

/// Virtual address at which the active page directory is visible.
pub const PGDIR_ADDR: u32 = PGTBL_BASE + (RECURSIVE_SLOT << 12);

/// Kernel pages reserved at boot for temporarily mapping foreign frames.
///
/// Copy-on-write needs two: one for the source frame, one for the copy.
pub const TRANSIENT_WINDOW_PAGES: u32 = 2;

/// How far below the current stack boundary a fault may grow the stack.
pub const STACK_GROWTH_MAX_PAGES: u32 = 1024;

/// Exception vector of the page fault.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Where the kernel image is loaded in physical memory.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

const _: () = {
    assert!(KMEM_START.is_multiple_of(1 << 22));
    assert!(USER_MEM_START.is_multiple_of(1 << 22));
    assert!(USER_MEM_START < KMEM_START);
    assert!(KMEM_START < PGTBL_BASE);
    assert!(PGDIR_ADDR == 0xFFFF_F000);
    assert!(PGTBL_BASE == 0xFFC0_0000);
    assert!(KERNEL_DIR_START == 768);
    assert!(USER_DIR_START == 1);
    assert!(PHYS_LOAD < USER_MEM_START);
};

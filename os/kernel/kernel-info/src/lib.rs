//! # Kernel Memory Layout and Boot Interface
//!
//! This crate defines the memory layout constants and the boot handoff
//! types that the memory-management crates agree on. It is the single
//! source of truth for where user space ends, where the kernel lives and
//! where the recursively mapped page tables appear.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! The bootloader-to-kernel handoff as far as memory management cares:
//! * **Memory Map**: `(base, length, usable)` regions
//! * **Kernel Image**: the physical range the frame allocator must never hand out
//!
//! ### Memory Layout ([`memory`])
//! The i386 two-level paging layout:
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000     ┌─────────────────────────────────┐
//!                 │  Identity map of the kernel     │
//!                 │  image (supervisor only)        │
//! USER_MEM_START  ├─────────────────────────────────┤ 0x0040_0000
//!                 │         User Space              │
//!                 │  (per process, COW shared)      │
//! KMEM_START      ├─────────────────────────────────┤ 0xC000_0000
//!                 │        Kernel Space             │
//!                 │  (identical in every process)   │
//! PGTBL_BASE      ├─────────────────────────────────┤ 0xFFC0_0000
//!                 │  Recursive window: page tables  │
//! PGDIR_ADDR      ├─────────────────────────────────┤ 0xFFFF_F000
//!                 │  The page directory itself      │
//! 0xFFFF_FFFF     └─────────────────────────────────┘
//! ```
//!
//! Layout invariants are checked at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;

//! # Typed i386 Control Registers
//!
//! The registers paging depends on: CR0 (paging enable, write protect),
//! CR2 (faulting linear address) and CR3 (page directory base).
//!
//! The `asm` feature provides the privileged load/store implementations.
//! They are only compiled for `target_arch = "x86"`; other targets get the
//! plain bitfield types, which is what host-side tests use.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, writing CR3 switches the address space the CPU executes in.
    unsafe fn store_unsafe(self);
}

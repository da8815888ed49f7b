//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page numbers
//! used in paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses, or addresses and page numbers, at compile time while
//! remaining zero-cost wrappers around `u32` values.
//!
//! | Type | Unit | Description |
//! |------|------|-------------|
//! | [`VirtualAddress`] | byte | An address as seen through the page tables. |
//! | [`PhysicalAddress`] | byte | An address on the memory bus. |
//! | [`VirtualPage`] | page number | `VirtualAddress >> 12`; the key of every per-page structure. |
//! | [`PhysicalPage`] | frame number | `PhysicalAddress >> 12`; the unit handed out by the frame allocator. |
//!
//! Only 4 KiB pages exist in this address model; large pages are not used.
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys.
//! - All alignment and offset calculations are `const fn`.
//! - Page numbers (not page base addresses) are stored so that the full
//!   4 GiB space, including the last page, stays representable.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset of an address.
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

/// Number of pages in the 32-bit virtual address space.
pub const PAGE_COUNT: u32 = 1 << (32 - PAGE_SHIFT);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` if that overflows.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

//! # Kernel synchronization primitives
//!
//! The memory manager runs on a single CPU; its mutual exclusion is
//! "interrupts disabled" ([`IrqGuard`]). [`SpinLock`] is kept for globals
//! that may also be touched from interrupt context, such as the logger, and
//! is taken through [`SpinLock::lock_irq`] there.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLockGuard, interrupts_enabled};
pub use spin_lock::{SpinLock, SpinLockGuard};

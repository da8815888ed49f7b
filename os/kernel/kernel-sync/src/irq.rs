use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// A spin lock guard that also disables interrupts while held.
///
/// When created via [`SpinLock::lock_irq`], it:
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying lock,
///
/// releasing them in reverse order on drop.
///
/// This prevents interrupt handlers from preempting the critical section
/// and spinning forever on the lock the interrupted code holds.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinLock;
///
/// static COUNTER: SpinLock<u32> = SpinLock::new(0);
///
/// {
///     let mut g = COUNTER.lock_irq();
///     *g += 1;
/// }
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct IrqSpinLockGuard<'a, T> {
    // Field order matters: the lock is released before interrupts come back.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Acquires the lock with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
mod hw {
    /// `IF` bit of EFLAGS/RFLAGS.
    const IF: usize = 1 << 9;

    #[inline]
    pub fn cli_stop_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn sti_enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let flags: usize;
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("pushfd; pop {}", out(reg) flags, options(preserves_flags));
        }
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) flags, options(preserves_flags));
        }
        flags & IF != 0
    }
}

/// Hosted builds have no interrupt flag to toggle; a process-wide flag
/// stands in for it so guard nesting behaves as on hardware.
#[cfg(not(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64"))))]
mod hw {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn cli_stop_interrupts() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn sti_enable_interrupts() {
        ENABLED.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted (ring 0).
#[inline]
pub fn cli_stop_interrupts() {
    hw::cli_stop_interrupts();
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    hw::sti_enable_interrupts();
}

/// Whether the `IF` flag is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    hw::interrupts_enabled()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts on drop.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

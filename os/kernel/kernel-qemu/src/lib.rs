//! # QEMU Debug Console Output
//!
//! Logging backend for kernels running under QEMU. Bytes written to I/O
//! port `0x402` show up on the host through `-debugcon`:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.bin -debugcon stdio
//! ```
//!
//! ## Components
//!
//! * [`QemuLogger`]: a `log::Log` implementation. Lines are formatted as
//!   `"[LEVEL] target: message\n"` and serialised with a spin lock taken with
//!   interrupts disabled, so a page fault logging in the middle of another
//!   line cannot interleave with it.
//! * [`qemu_trace!`]: direct, unlocked output for the earliest boot code.
//!
//! The port write only exists on bare-metal x86 targets; everywhere else the
//! sink discards its input, which keeps the memory-management crates testable
//! on the host with the logger still wired in.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    #[cfg(all(
        feature = "enabled",
        target_os = "none",
        any(target_arch = "x86", target_arch = "x86_64")
    ))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[cfg(all(
        feature = "enabled",
        target_os = "none",
        any(target_arch = "x86", target_arch = "x86_64")
    ))]
    #[inline]
    pub fn dbg_putc(c: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// No debug port here; output is dropped.
    #[cfg(not(all(
        feature = "enabled",
        target_os = "none",
        any(target_arch = "x86", target_arch = "x86_64")
    )))]
    #[inline]
    pub fn dbg_putc(_c: u8) {}

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort debug output.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

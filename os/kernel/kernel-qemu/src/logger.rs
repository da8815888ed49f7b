use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use kernel_sync::SpinLock;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend for the QEMU debug console.
pub struct QemuLogger {
    /// Serialises whole lines.
    line: SpinLock<()>,
}

static LOGGER: QemuLogger = QemuLogger {
    line: SpinLock::new(()),
};

impl QemuLogger {
    /// Install the logger. Call this once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

/// Format one record as `"[LEVEL] target: message\n"`.
fn write_line(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _line = self.line.lock_irq();
        let _ = write_line(&mut QemuSink, record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn line_format() {
        let mut out = String::new();
        write_line(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel_alloc::vmm")
                .args(format_args!("page {:#x} already not mapped", 0x400u32))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel_alloc::vmm: page 0x400 already not mapped\n");
    }

    #[test]
    fn logging_does_not_leave_the_line_lock_held() {
        LOGGER.log(
            &Record::builder()
                .level(Level::Error)
                .args(format_args!("hello"))
                .build(),
        );
        assert!(!LOGGER.line.is_locked());
    }
}

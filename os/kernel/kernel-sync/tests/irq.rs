//! The hosted interrupt flag is process-wide, so everything touching it
//! lives in a single test.

use kernel_sync::{IrqGuard, SpinLock, interrupts_enabled};

#[test]
fn guards_nest_and_restore_the_outer_state() {
    assert!(interrupts_enabled());

    {
        let outer = IrqGuard::new();
        assert!(outer.restores());
        assert!(!interrupts_enabled());

        {
            let inner = IrqGuard::new();
            assert!(!inner.restores());
            assert!(!interrupts_enabled());
        }

        // Dropping the inner guard must not re-enable interrupts.
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    let lock = SpinLock::new(5u32);
    {
        let mut g = lock.lock_irq();
        *g += 1;
        assert!(!interrupts_enabled());
        assert!(lock.try_lock().is_none());
    }
    assert!(interrupts_enabled());
    assert_eq!(*lock.lock(), 6);
}

use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;
use core::ops::Add;

/// Physical page frame, identified by its frame number.
///
/// ### Invariants
/// - `base()` is always page aligned.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::containing(PhysicalAddress::new(0x0030_0FFF));
/// assert_eq!(frame.index(), 0x300);
/// assert_eq!(frame.base().as_u32(), 0x0030_0000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        debug_assert!(index < (1 << (32 - PAGE_SHIFT)));
        Self(index)
    }

    /// Frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.page()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(#{} @ {})", self.0, self.base())
    }
}

impl Add<u32> for PhysicalPage {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self::from_index(self.0 + rhs)
    }
}

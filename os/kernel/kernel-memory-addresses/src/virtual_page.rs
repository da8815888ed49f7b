use crate::{PAGE_COUNT, PAGE_SHIFT, VirtualAddress};
use core::fmt;
use core::ops::{Add, Sub};

/// Virtual page, identified by its page number.
///
/// Page numbers are what the range allocator, the page tables and the
/// per-process page registry are keyed by.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let vp = VirtualPage::containing_address(VirtualAddress::new(0xC000_0FFF));
/// assert_eq!(vp.index(), 0xC0000);
/// assert_eq!(vp.base().as_u32(), 0xC000_0000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u32);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        debug_assert!(index < PAGE_COUNT);
        Self(index)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        addr.page()
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << PAGE_SHIFT)
    }

    /// `self + n`, or `None` past the end of the address space.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, n: u32) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(v) if v < PAGE_COUNT => Some(Self(v)),
            _ => None,
        }
    }

    /// `self - n`, or `None` below page zero.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, n: u32) -> Option<Self> {
        match self.0.checked_sub(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Iterate `count` consecutive pages starting at `self`.
    #[inline]
    pub fn pages(self, count: u32) -> impl Iterator<Item = Self> {
        (self.0..self.0 + count).map(Self)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(#{:#X} @ {})", self.0, self.base())
    }
}

impl Add<u32> for VirtualPage {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self::from_index(self.0 + rhs)
    }
}

impl Sub<u32> for VirtualPage {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Self::from_index(self.0 - rhs)
    }
}

/// Distance in pages between two pages (`self` must not precede `rhs`).
impl Sub<Self> for VirtualPage {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

use core::{fmt, ptr};

use crate::{PAGE_SHIFT, PAGE_SIZE};

macro_rules! impl_hex {
    ($ty:ty) => {
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }
    };
}

/// Physical address of a byte in RAM.
///
/// The allocator assumes physical memory is identity mapped, so a
/// `PhysAddr` can be turned into a pointer with [`PhysAddr::as_mut_ptr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);
impl_hex!(PhysAddr);

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = &ptr::without_provenance::<u8>(self.0);
        fmt::Pointer::fmt(ptr, f)
    }
}

impl PhysAddr {
    /// Creates a physical address from a raw address value.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Creates a physical address from a pointer.
    ///
    /// The pointer's provenance is exposed so that the address can be turned
    /// back into a usable pointer later.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns a pointer to the byte at this address.
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        ptr::with_exposed_provenance_mut(self.0)
    }

    /// Returns the physical page number containing this address.
    #[must_use]
    pub const fn page_num(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0.is_multiple_of(PAGE_SIZE)
    }

    /// Rounds the address up to the next page boundary.
    ///
    /// Returns `None` if rounding overflows the address space.
    #[must_use]
    pub const fn page_align_up(self) -> Option<Self> {
        match self.0.checked_next_multiple_of(PAGE_SIZE) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    #[must_use]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 / PAGE_SIZE * PAGE_SIZE)
    }

    /// Adds `pages` whole pages to this address.
    ///
    /// Returns `None` if the addition would overflow.
    #[must_use]
    pub fn checked_add_pages(self, pages: usize) -> Option<Self> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }

    /// Returns the distance in bytes from `base` to this address.
    ///
    /// Returns `None` if `base` lies above this address.
    #[must_use]
    pub fn checked_offset_from(self, base: Self) -> Option<usize> {
        self.0.checked_sub(base.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert!(PhysAddr::new(0).is_page_aligned());
        assert!(PhysAddr::new(0x8000_3000).is_page_aligned());
        assert!(!PhysAddr::new(0x8000_3001).is_page_aligned());

        assert_eq!(
            PhysAddr::new(0x8000_3001).page_align_up(),
            Some(PhysAddr::new(0x8000_4000))
        );
        assert_eq!(
            PhysAddr::new(0x8000_3000).page_align_up(),
            Some(PhysAddr::new(0x8000_3000))
        );
        assert_eq!(
            PhysAddr::new(0x8000_3fff).page_align_down(),
            PhysAddr::new(0x8000_3000)
        );
        assert_eq!(PhysAddr::new(usize::MAX).page_align_up(), None);
    }

    #[test]
    fn test_page_arithmetic() {
        let pa = PhysAddr::new(0x8000_0000);
        assert_eq!(pa.checked_add_pages(3), Some(PhysAddr::new(0x8000_3000)));
        assert_eq!(pa.page_num(), 0x8_0000);
        assert_eq!(PhysAddr::new(usize::MAX).checked_add_pages(1), None);

        let end = PhysAddr::new(0x8000_5000);
        assert_eq!(end.checked_offset_from(pa), Some(0x5000));
        assert_eq!(pa.checked_offset_from(end), None);
    }

    #[test]
    fn test_format() {
        let pa = PhysAddr::new(0x8020_1000);
        assert_eq!(format!("{pa:#x}"), "0x80201000");
        assert_eq!(format!("{pa:X}"), "80201000");
    }
}

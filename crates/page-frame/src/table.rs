//! Per-page metadata table.
//!
//! Every managed page owns one [`PageInfo`] entry holding its reference count
//! and, while the page is free, the index of the next free page. The free
//! list is threaded through these entries rather than through the pages'
//! own bytes, so a free page's contents are never interpreted by the
//! allocator.
//!
//! ```text
//!          head
//!           │
//!           ▼
//! ┌──────┬──────┬──────┬──────┬──────┐
//! │ refs │ refs │ refs │ refs │ refs │
//! │  1   │  0   │  3   │  0   │  0   │
//! ├──────┼──────┼──────┼──────┼──────┤
//! │ next │ next │ next │ next │ next │
//! │  -   │  4   │  -   │  1   │ nil  │
//! └──────┴──────┴──────┴──────┴──────┘
//!    0      1      2      3      4
//! ```

use core::{fmt, num::NonZeroU32, ptr::NonNull};

use crate::PAGE_SIZE;

/// Marker stored in [`PageInfo::next_free`] for the end of the free list.
const NIL: u32 = u32::MAX;

/// Reference count of a page whose last owner released it and which is
/// being scrubbed before it is put back on the free list.
const RETIRING: u32 = u32::MAX;

/// Initial reference count of pages holding the table itself.
///
/// The bootstrap pass releases every page once, leaving these at one owner
/// forever.
const METADATA_REFS: u32 = 2;

/// Dense, zero-based position of a page within the managed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PageIndex(u32);

impl PageIndex {
    /// Largest number of pages a table can describe.
    pub(crate) const LIMIT: usize = NIL as usize;

    pub(crate) fn new(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .filter(|&index| index != NIL)
            .map(Self)
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[repr(C)]
#[derive(Debug)]
pub(crate) struct PageInfo {
    refs: u32,
    next_free: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
    /// On the free list.
    Free,
    /// Released by its last owner, not yet on the free list.
    Retiring,
    /// Owned by this many owners.
    InUse(NonZeroU32),
}

/// Outcome of dropping one reference to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Released {
    /// Other owners remain.
    Shared(NonZeroU32),
    /// That was the last owner; the page is now retiring.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefError {
    NotAllocated,
    Overflow,
}

/// Reference-count table and the free list threaded through it.
#[derive(Debug)]
pub(crate) struct PageTable {
    entries: NonNull<PageInfo>,
    len: usize,
    head: u32,
    free_pages: usize,
}

// The table exclusively owns the entries it points to.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Returns the number of pages needed to store the table for
    /// `page_count` pages.
    pub(crate) const fn pages_for(page_count: usize) -> usize {
        (page_count * size_of::<PageInfo>()).div_ceil(PAGE_SIZE)
    }

    /// Builds a table of `len` entries at `entries`.
    ///
    /// The first `metadata_pages` entries are seeded so that they survive one
    /// release; every other entry starts with a single owner. The free list
    /// is empty until pages are released.
    ///
    /// # Safety
    ///
    /// - `entries` must be valid for writes of `len` `PageInfo`s and
    ///   properly aligned.
    /// - The memory must not be accessed through any other pointer while
    ///   the table is alive.
    pub(crate) unsafe fn new(
        entries: NonNull<PageInfo>,
        len: usize,
        metadata_pages: usize,
    ) -> Self {
        assert!(len <= PageIndex::LIMIT, "too many pages: {len}");
        assert!(
            metadata_pages <= len,
            "metadata pages {metadata_pages} exceed table length {len}"
        );

        for i in 0..len {
            let refs = if i < metadata_pages { METADATA_REFS } else { 1 };
            unsafe {
                entries.add(i).write(PageInfo {
                    refs,
                    next_free: NIL,
                });
            }
        }

        Self {
            entries,
            len,
            head: NIL,
            free_pages: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.free_pages
    }

    fn entry(&self, index: PageIndex) -> &PageInfo {
        assert!(index.as_usize() < self.len, "page index {index} out of range");
        unsafe { self.entries.add(index.as_usize()).as_ref() }
    }

    fn entry_mut(&mut self, index: PageIndex) -> &mut PageInfo {
        assert!(index.as_usize() < self.len, "page index {index} out of range");
        unsafe { self.entries.add(index.as_usize()).as_mut() }
    }

    pub(crate) fn state(&self, index: PageIndex) -> PageState {
        match self.entry(index).refs {
            0 => PageState::Free,
            RETIRING => PageState::Retiring,
            refs => PageState::InUse(NonZeroU32::new(refs).unwrap_or(NonZeroU32::MIN)),
        }
    }

    /// Takes the page at the head of the free list and gives it one owner.
    pub(crate) fn pop_free(&mut self) -> Option<PageIndex> {
        if self.head == NIL {
            return None;
        }
        let index = PageIndex(self.head);
        let entry = self.entry_mut(index);
        debug_assert_eq!(entry.refs, 0, "page {index} on free list is in use");
        let next = entry.next_free;
        entry.refs = 1;
        entry.next_free = NIL;
        self.head = next;
        self.free_pages -= 1;
        Some(index)
    }

    /// Puts a retiring page at the head of the free list.
    ///
    /// # Panics
    ///
    /// Panics if the page is not retiring.
    pub(crate) fn push_free(&mut self, index: PageIndex) {
        let head = self.head;
        let entry = self.entry_mut(index);
        assert_eq!(entry.refs, RETIRING, "page {index} is not retiring");
        entry.refs = 0;
        entry.next_free = head;
        self.head = index.0;
        self.free_pages += 1;
    }

    /// Records one more owner of an in-use page.
    pub(crate) fn acquire(&mut self, index: PageIndex) -> Result<NonZeroU32, RefError> {
        let PageState::InUse(refs) = self.state(index) else {
            return Err(RefError::NotAllocated);
        };
        let refs = refs
            .checked_add(1)
            .filter(|refs| refs.get() != RETIRING)
            .ok_or(RefError::Overflow)?;
        self.entry_mut(index).refs = refs.get();
        Ok(refs)
    }

    /// Drops one owner of an in-use page.
    ///
    /// When the last owner goes away the page becomes retiring: it is
    /// neither owned nor free, and the caller must finish reclaiming it with
    /// [`PageTable::push_free`].
    pub(crate) fn release(&mut self, index: PageIndex) -> Result<Released, RefError> {
        let PageState::InUse(refs) = self.state(index) else {
            return Err(RefError::NotAllocated);
        };
        let entry = self.entry_mut(index);
        match NonZeroU32::new(refs.get() - 1) {
            Some(remaining) => {
                entry.refs = remaining.get();
                Ok(Released::Shared(remaining))
            }
            None => {
                entry.refs = RETIRING;
                Ok(Released::Last)
            }
        }
    }

    /// Iterates over the free list from its head.
    #[cfg(test)]
    pub(crate) fn free_list(&self) -> impl Iterator<Item = PageIndex> + '_ {
        let mut next = self.head;
        core::iter::from_fn(move || {
            if next == NIL {
                return None;
            }
            let index = PageIndex(next);
            next = self.entry(index).next_free;
            Some(index)
        })
    }
}

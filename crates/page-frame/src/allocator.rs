//! Reference-counted physical page allocator.
//!
//! [`PageAllocator`] hands out whole [`PAGE_SIZE`] pages of physical memory
//! and tracks how many owners each page has, so that a page can be shared
//! between address spaces (for example by copy-on-write fork) and is only
//! reclaimed when its last owner lets go.
//!
//! # Layout
//!
//! The allocator manages every whole page between the first page boundary
//! at or after the end of the kernel image and the top of physical memory.
//! The first few of those pages hold the allocator's own metadata table and
//! are never handed out.
//!
//! ```text
//! kernel_end  base                                        end  phys_top
//!     │        │                                           │       │
//!     ▼        ▼                                           ▼       ▼
//! ────┬────────┬──────────┬──────┬──────┬─────┬──────┬─────┬───────┬
//!     │ (pad)  │ metadata │ page │ page │ ... │ page │ page│(tail) │
//! ────┴────────┴──────────┴──────┴──────┴─────┴──────┴─────┴───────┴
//!              │◄────────────── managed range ──────────────►│
//! ```
//!
//! # Bootstrap
//!
//! Construction seeds the metadata pages with two owners and every other page
//! with one, then releases every page in the range once through the same
//! path [`PageAllocator::release`] uses. Ordinary pages drop to zero owners
//! and land on the free list; metadata pages are left with one owner that
//! never goes away.
//!
//! # Locking
//!
//! The table and free list live behind a single spin lock. Filling a page
//! with the diagnostic pattern happens outside the lock; while a released
//! page is being filled it is in a retiring state in which any attempt to
//! share or release it again is reported as a contract violation.

use core::{ops::Range, ptr::NonNull};

use snafu::{OptionExt as _, ensure};
use spin::Mutex;

use crate::{
    PAGE_SIZE,
    address::PhysAddr,
    error::{
        AboveRangeSnafu, AddressOverflowSnafu, BelowRangeSnafu, EmptyRangeSnafu, InitError,
        MetadataSnafu, MisalignedSnafu, NotAllocatedSnafu, NullAddressSnafu, PageError,
        RefCountOverflowSnafu, TooManyPagesSnafu, report,
    },
    table::{PageIndex, PageInfo, PageState, PageTable, RefError, Released},
};

/// Byte written over every page handed out by [`PageAllocator::allocate`].
pub const ALLOC_FILL: u8 = 0x05;

/// Byte written over every page when its last owner releases it.
pub const FREE_FILL: u8 = 0x01;

/// Snapshot of the allocator's page accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    /// Pages in the managed range, metadata included.
    pub total_pages: usize,
    /// Pages holding the reference-count table.
    pub metadata_pages: usize,
    /// Pages currently on the free list.
    pub free_pages: usize,
}

/// Physical page allocator with per-page reference counts.
#[derive(Debug)]
pub struct PageAllocator {
    kernel_end: PhysAddr,
    base: PhysAddr,
    end: PhysAddr,
    metadata_pages: usize,
    table: Mutex<PageTable>,
}

impl PageAllocator {
    /// Carves `kernel_end..phys_top` into pages and builds an allocator over
    /// them.
    ///
    /// `kernel_end` is the first address after the kernel's code and static
    /// data and need not be page-aligned. A trailing partial page below
    /// `phys_top` is left unmanaged.
    ///
    /// # Safety
    ///
    /// - `kernel_end..phys_top` must be identity-mapped, writable RAM.
    /// - Nothing else may access that memory for as long as the allocator
    ///   is alive, except through pages the allocator hands out.
    pub unsafe fn new(kernel_end: PhysAddr, phys_top: PhysAddr) -> Result<Self, InitError> {
        let base = kernel_end
            .page_align_up()
            .context(AddressOverflowSnafu { kernel_end })?;
        let page_count = phys_top
            .checked_offset_from(base)
            .map_or(0, |bytes| bytes / PAGE_SIZE);
        ensure!(
            page_count > 0,
            EmptyRangeSnafu {
                start: base,
                phys_top
            }
        );
        ensure!(page_count <= PageIndex::LIMIT, TooManyPagesSnafu { page_count });
        let entries = NonNull::new(base.as_mut_ptr::<PageInfo>()).context(NullAddressSnafu)?;

        let metadata_pages = PageTable::pages_for(page_count);
        let table = unsafe { PageTable::new(entries, page_count, metadata_pages) };
        let end = PhysAddr::new(base.addr() + page_count * PAGE_SIZE);

        let allocator = Self {
            kernel_end,
            base,
            end,
            metadata_pages,
            table: Mutex::new(table),
        };

        log::debug!(
            "page allocator: {page_count} pages at {base:#x}..{end:#x}, {metadata_pages} for metadata"
        );

        for i in 0..page_count {
            let Some(index) = PageIndex::new(i) else {
                unreachable!("page count is checked against the index limit");
            };
            if let Err(err) = allocator.reclaim(index) {
                unreachable!("freshly seeded page {index} rejected release: {err:?}");
            }
        }

        log::debug!(
            "page allocator: {} pages free",
            allocator.table.lock().free_pages()
        );

        Ok(allocator)
    }

    /// Returns the whole managed range, metadata pages included.
    #[must_use]
    pub fn managed_range(&self) -> Range<PhysAddr> {
        self.base..self.end
    }

    /// Returns the range of pages that can be handed out.
    #[must_use]
    pub fn heap_range(&self) -> Range<PhysAddr> {
        self.page_addr_at(self.metadata_pages)..self.end
    }

    /// Checks whether `pa` lies in a page that can be handed out.
    #[must_use]
    pub fn contains(&self, pa: PhysAddr) -> bool {
        self.heap_range().contains(&pa)
    }

    #[must_use]
    pub fn stats(&self) -> PageStats {
        let table = self.table.lock();
        PageStats {
            total_pages: table.len(),
            metadata_pages: self.metadata_pages,
            free_pages: table.free_pages(),
        }
    }

    /// Allocates one page.
    ///
    /// The returned page has exactly one owner. Its contents are not zeroed.
    /// Returns `None` if no page is free.
    #[must_use]
    pub fn allocate(&self) -> Option<PhysAddr> {
        let index = self.table.lock().pop_free();
        let Some(index) = index else {
            log::trace!("page allocator: out of pages");
            return None;
        };
        self.fill(index, ALLOC_FILL);
        Some(self.page_addr(index))
    }

    /// Allocates one zero-filled page.
    #[must_use]
    pub fn allocate_zeroed(&self) -> Option<PhysAddr> {
        let pa = self.allocate()?;
        unsafe {
            pa.as_mut_ptr::<u8>().write_bytes(0, PAGE_SIZE);
        }
        Some(pa)
    }

    /// Drops one owner of the page at `pa`.
    ///
    /// The page returns to the free list when its last owner releases it.
    /// Nothing is modified if `pa` is rejected.
    #[track_caller]
    pub fn try_release(&self, pa: PhysAddr) -> Result<(), PageError> {
        let index = self.owned_index(pa)?;
        match self.reclaim(index) {
            Ok(()) => Ok(()),
            Err(err) => Err(ref_error(pa, err)),
        }
    }

    /// Drops one owner of the page at `pa`.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not an allocated page inside the managed range.
    #[track_caller]
    pub fn release(&self, pa: PhysAddr) {
        if let Err(err) = self.try_release(pa) {
            report(&err);
        }
    }

    /// Records one more owner of the page at `pa`.
    ///
    /// Nothing is modified if `pa` is rejected.
    #[track_caller]
    pub fn try_share(&self, pa: PhysAddr) -> Result<(), PageError> {
        let index = self.owned_index(pa)?;
        let acquired = self.table.lock().acquire(index);
        match acquired {
            Ok(_) => Ok(()),
            Err(err) => Err(ref_error(pa, err)),
        }
    }

    /// Records one more owner of the page at `pa`.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not an allocated page inside the managed range, or
    /// if the page already has the maximum number of owners.
    #[track_caller]
    pub fn share(&self, pa: PhysAddr) {
        if let Err(err) = self.try_share(pa) {
            report(&err);
        }
    }

    /// Returns the number of owners of the page at `pa`.
    ///
    /// Free pages have no owners. Metadata pages report a single owner.
    #[track_caller]
    pub fn ref_count(&self, pa: PhysAddr) -> Result<u32, PageError> {
        let index = self.page_index(pa)?;
        let state = self.table.lock().state(index);
        Ok(match state {
            PageState::Free | PageState::Retiring => 0,
            PageState::InUse(refs) => refs.get(),
        })
    }

    /// Drops one owner of a page and, if it was the last one, scrubs the page
    /// and puts it on the free list.
    fn reclaim(&self, index: PageIndex) -> Result<(), RefError> {
        let released = self.table.lock().release(index)?;
        match released {
            Released::Shared(remaining) => {
                log::trace!("page allocator: page {index} still has {remaining} owners");
            }
            Released::Last => {
                self.fill(index, FREE_FILL);
                self.table.lock().push_free(index);
            }
        }
        Ok(())
    }

    fn fill(&self, index: PageIndex, byte: u8) {
        if cfg!(feature = "junk-fill") {
            unsafe {
                self.page_addr(index)
                    .as_mut_ptr::<u8>()
                    .write_bytes(byte, PAGE_SIZE);
            }
        }
    }

    fn page_addr(&self, index: PageIndex) -> PhysAddr {
        self.page_addr_at(index.as_usize())
    }

    fn page_addr_at(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.base.addr() + index * PAGE_SIZE)
    }

    #[track_caller]
    fn page_index(&self, addr: PhysAddr) -> Result<PageIndex, PageError> {
        ensure!(addr.is_page_aligned(), MisalignedSnafu { addr });
        ensure!(
            addr >= self.kernel_end,
            BelowRangeSnafu {
                addr,
                start: self.kernel_end
            }
        );
        ensure!(addr < self.end, AboveRangeSnafu { addr, end: self.end });
        addr.checked_offset_from(self.base)
            .and_then(|offset| PageIndex::new(offset / PAGE_SIZE))
            .context(BelowRangeSnafu {
                addr,
                start: self.base,
            })
    }

    #[track_caller]
    fn owned_index(&self, addr: PhysAddr) -> Result<PageIndex, PageError> {
        let index = self.page_index(addr)?;
        ensure!(
            index.as_usize() >= self.metadata_pages,
            MetadataSnafu { addr }
        );
        Ok(index)
    }
}

#[track_caller]
fn ref_error(addr: PhysAddr, err: RefError) -> PageError {
    match err {
        RefError::NotAllocated => NotAllocatedSnafu { addr }.build(),
        RefError::Overflow => RefCountOverflowSnafu { addr }.build(),
    }
}

//! Physical page allocator for the Onix kernel.
//!
//! This crate hands out and reclaims whole 4096-byte pages of physical
//! memory for user processes, kernel stacks, page-table pages and pipe
//! buffers. Each page carries a reference count so that it can be shared
//! between address spaces, as copy-on-write fork does, and is only returned
//! to the free list when its last owner releases it.
//!
//! # Usage
//!
//! ```rust
//! # #[repr(C, align(4096))]
//! # struct Page([u8; page_frame::PAGE_SIZE]);
//! # let mut ram = (0..16).map(|_| Page([0; page_frame::PAGE_SIZE])).collect::<Vec<_>>();
//! use page_frame::{PageAllocator, PhysAddr};
//!
//! // In the kernel these would be the end of the kernel image and PHYSTOP.
//! let kernel_end = PhysAddr::from_ptr(ram.as_mut_ptr());
//! let phys_top = kernel_end.checked_add_pages(16).unwrap();
//!
//! let allocator = unsafe { PageAllocator::new(kernel_end, phys_top) }.unwrap();
//!
//! let pa = allocator.allocate().unwrap();
//! allocator.share(pa); // a second address space maps the page
//! assert_eq!(allocator.ref_count(pa).unwrap(), 2);
//!
//! allocator.release(pa);
//! allocator.release(pa); // last owner, back on the free list
//! assert_eq!(allocator.allocate(), Some(pa));
//! ```
//!
//! # Errors
//!
//! Running out of pages is an ordinary condition and is reported as `None`
//! from [`PageAllocator::allocate`]. Handing the allocator an address it
//! never gave out is a kernel bug: [`PageAllocator::release`] and
//! [`PageAllocator::share`] panic on it, while
//! [`PageAllocator::try_release`] and [`PageAllocator::try_share`] return
//! the [`PageError`] instead.
//!
//! # Features
//!
//! - `junk-fill` (default): fill pages with [`ALLOC_FILL`] when they are
//!   handed out and with [`FREE_FILL`] when they are reclaimed, to surface
//!   reads of uninitialized memory and dangling references.

#![cfg_attr(not(test), no_std)]

pub use self::{
    address::PhysAddr,
    allocator::{ALLOC_FILL, FREE_FILL, PageAllocator, PageStats},
    error::{InitError, Location, PageError},
};

pub mod address;
mod allocator;
pub mod error;
mod table;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

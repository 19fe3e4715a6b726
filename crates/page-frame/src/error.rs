use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::address::PhysAddr;

/// Source location captured when an error value is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors returned while carving a physical memory range into pages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("rounding {kernel_end:#x} up to a page boundary overflows"))]
    AddressOverflow {
        kernel_end: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page table cannot be placed at the null address"))]
    NullAddress {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no whole page between {start:#x} and {phys_top:#x}"))]
    EmptyRange {
        start: PhysAddr,
        phys_top: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{page_count} pages exceed the page index limit"))]
    TooManyPages {
        page_count: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Contract violations detected on a page address handed back to the
/// allocator.
///
/// None of these are expected at runtime: each one is a kernel bug, and the
/// allocator's state is left untouched when one is reported.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PageError {
    #[snafu(display("page address {addr:#x} is not page-aligned"))]
    Misaligned {
        addr: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page address {addr:#x} is below the first usable address {start:#x}"))]
    BelowRange {
        addr: PhysAddr,
        start: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page address {addr:#x} is not below the end of managed memory {end:#x}"))]
    AboveRange {
        addr: PhysAddr,
        end: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page address {addr:#x} holds allocator metadata"))]
    Metadata {
        addr: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page address {addr:#x} is not allocated"))]
    NotAllocated {
        addr: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("reference count of page {addr:#x} overflows"))]
    RefCountOverflow {
        addr: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PageError {
    /// Returns the page address the violation was detected on.
    #[must_use]
    pub fn addr(&self) -> PhysAddr {
        match self {
            Self::Misaligned { addr, .. }
            | Self::BelowRange { addr, .. }
            | Self::AboveRange { addr, .. }
            | Self::Metadata { addr, .. }
            | Self::NotAllocated { addr, .. }
            | Self::RefCountOverflow { addr, .. } => *addr,
        }
    }

    /// Returns where the violation was detected.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Misaligned { location, .. }
            | Self::BelowRange { location, .. }
            | Self::AboveRange { location, .. }
            | Self::Metadata { location, .. }
            | Self::NotAllocated { location, .. }
            | Self::RefCountOverflow { location, .. } => *location,
        }
    }
}

/// Halts on a page contract violation.
///
/// The allocator cannot trust any of its own state once a caller has handed
/// it a bogus page, so there is nothing to recover to.
#[track_caller]
pub(crate) fn report(err: &PageError) -> ! {
    log::error!("page allocator contract violation: {err}");
    panic!("{err}\n  at {}", err.location());
}

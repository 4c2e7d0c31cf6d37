//! Bump allocator backing the allocations the symbol resolver makes before the
//! real allocator is known.  Memory handed out here is never reclaimed.

use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::config::MIN_ALIGN;

#[repr(C, align(16))]
struct Region<const N: usize>(UnsafeCell<[u8; N]>);

/// Fixed-capacity region with a monotonically increasing offset.
pub struct BumpArena<const N: usize> {
    region: Region<N>,
    offset: AtomicUsize,
}

// Every byte range in `region` is handed out to at most one caller.
unsafe impl<const N: usize> Sync for BumpArena<N> {}

impl<const N: usize> BumpArena<N> {
    pub const fn new() -> Self {
        BumpArena {
            region: Region(UnsafeCell::new([0; N])),
            offset: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> usize {
        self.region.0.get() as usize
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Bytes consumed so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    /// Reserve `size` bytes aligned to `align` (at least [`MIN_ALIGN`]).
    /// Returns `None` when the remaining capacity cannot fit the request.
    pub fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let align = align.max(MIN_ALIGN).checked_next_power_of_two()?;
        // Zero-sized requests still get a unique address.
        let size = size.max(1);
        let base = self.base();

        let mut current = self.offset.load(Ordering::Relaxed);
        loop {
            let start = (base + current).checked_add(align - 1)? & !(align - 1);
            let start = start - base;
            let end = start.checked_add(size)?;
            if end > N {
                return None;
            }
            match self.offset.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return NonNull::new((base + start) as *mut u8),
                Err(actual) => current = actual,
            }
        }
    }

    /// Does `ptr` point into this arena?
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        let base = self.base();
        addr >= base && addr < base + N
    }
}

impl<const N: usize> Default for BumpArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

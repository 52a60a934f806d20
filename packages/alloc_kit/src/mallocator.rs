use std::ptr::NonNull;

use crate::{Allocator, Result};

/// A general-purpose allocator that forwards to the platform `malloc()` and `free()`.
///
/// The alignment argument is accepted but not enforced beyond what the platform allocator
/// provides by default (suitable for any fundamental type). Use
/// [`AlignedAllocator`][crate::AlignedAllocator] for over-aligned requests.
///
/// A failed request yields `Ok(None)`. This allocator never returns an error.
///
/// The allocator is stateless, so any instance may release memory obtained from any other
/// instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mallocator {
    _private: (),
}

impl Mallocator {
    /// Creates a new allocator.
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Allocator for Mallocator {
    #[inline]
    fn allocate_raw(&self, size: usize, _alignment: usize) -> Result<Option<NonNull<u8>>> {
        // malloc(0) may legitimately return null, which we would mistake for failure.
        let size = size.max(1);

        // SAFETY: No safety requirements for malloc.
        let ptr = unsafe { libc::malloc(size) };

        Ok(NonNull::new(ptr.cast::<u8>()))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: The caller guarantees the pointer is null or came from malloc().
        unsafe {
            libc::free(ptr.cast());
        }
    }
}

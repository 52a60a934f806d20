//! Diagnostic decorator that reports every allocation of an inner allocator.

use std::ptr::NonNull;

use tracing::trace;

use crate::{Allocator, Result};

/// An allocator decorator that emits a trace-level `tracing` event for every successful
/// allocation and every deallocation performed through it.
///
/// Allocation events carry the fields `address`, `alignment` and `size`. Deallocation events
/// carry the field `address`. The decorator adds no behavior besides emitting these events,
/// so any allocator can be wrapped without changing its semantics.
///
/// To disable reporting, use the inner allocator directly. There is no residual cost.
///
/// # Examples
///
/// ```
/// use alloc_kit::{AllocatorExt, Mallocator, Reporting};
///
/// let allocator = Reporting::new(Mallocator::new());
///
/// // Emits a trace event with the address, alignment and size of the allocation.
/// let value = allocator.allocate::<u32>(1).unwrap().unwrap();
///
/// // Emits a trace event with the address being released.
/// // SAFETY: The pointer came from this allocator and holds no value that needs dropping.
/// unsafe { allocator.deallocate_typed(value) };
/// ```
#[derive(Debug, Default)]
pub struct Reporting<A> {
    inner: A,
}

impl<A> Reporting<A> {
    /// Wraps `inner`, reporting every allocation it performs.
    #[must_use]
    #[inline]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    /// The wrapped allocator.
    #[must_use]
    #[inline]
    pub const fn inner(&self) -> &A {
        &self.inner
    }

    /// Unwraps the decorator, returning the inner allocator.
    #[must_use]
    #[inline]
    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: Allocator> Allocator for Reporting<A> {
    #[inline]
    fn allocate_raw(&self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>> {
        let ptr = self.inner.allocate_raw(size, alignment)?;

        if let Some(address) = ptr {
            trace!(address = ?address, alignment, size, "allocated");
        }

        Ok(ptr)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: *mut u8) {
        trace!(address = ?ptr, "deallocating");

        // SAFETY: Forwarding safety requirements from the caller.
        unsafe {
            self.inner.deallocate(ptr);
        }
    }
}

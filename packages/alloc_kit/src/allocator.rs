use std::ptr::NonNull;

use crate::{Error, Result};

/// The capability contract every allocator in this crate implements.
///
/// An allocator converts a request for `size` bytes aligned to `alignment` into an address and
/// reverses that conversion when the address is handed back via [`deallocate()`][1].
///
/// What happens when a request cannot be satisfied depends on the allocator's
/// [failure policy][crate::FailurePolicy]: the request yields `Ok(None)`, an [`Error`], or a
/// panic. Allocators without a configurable policy document their behavior individually.
///
/// Every address returned by [`allocate_raw()`][2] must be passed to [`deallocate()`][1] on the
/// same allocator instance exactly once, or never (in which case the memory is leaked).
///
/// All methods take `&self`; allocators that need mutable bookkeeping use interior mutability
/// and are `!Sync` unless they synchronize internally.
///
/// [1]: Self::deallocate
/// [2]: Self::allocate_raw
#[cfg_attr(test, mockall::automock)]
pub trait Allocator {
    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The returned memory is uninitialized unless the allocator documents otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be satisfied and the allocator is configured to
    /// report failures as errors.
    fn allocate_raw(&self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>>;

    /// Releases memory previously returned by [`allocate_raw()`][Self::allocate_raw].
    ///
    /// A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` is null or was returned by this same allocator
    /// instance and has not already been deallocated. Any object stored in the memory must
    /// already have been dropped or must not require dropping.
    unsafe fn deallocate(&self, ptr: *mut u8);
}

/// Typed convenience operations, available on every [`Allocator`].
pub trait AllocatorExt: Allocator {
    /// Allocates uninitialized storage for `count` contiguous values of type `T`.
    ///
    /// The request is forwarded to [`Allocator::allocate_raw()`] with a size of
    /// `size_of::<T>() * count` bytes and the alignment of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeOverflow`] if the total size does not fit in `usize`, otherwise
    /// forwards any error from the underlying allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use alloc_kit::{AllocatorExt, Mallocator};
    ///
    /// let allocator = Mallocator::new();
    ///
    /// let numbers = allocator.allocate::<u64>(4).unwrap().unwrap();
    ///
    /// // SAFETY: We own 4 u64 slots and only ever write plain integers to them.
    /// unsafe {
    ///     for i in 0..4 {
    ///         numbers.add(i).write(i as u64);
    ///     }
    ///     assert_eq!(numbers.add(3).read(), 3);
    ///
    ///     allocator.deallocate_typed(numbers);
    /// }
    /// ```
    fn allocate<T>(&self, count: usize) -> Result<Option<NonNull<T>>> {
        let element_size = size_of::<T>();

        let size = element_size
            .checked_mul(count)
            .ok_or(Error::SizeOverflow {
                count,
                element_size,
            })?;

        Ok(self.allocate_raw(size, align_of::<T>())?.map(NonNull::cast))
    }

    /// Releases typed storage previously obtained from this allocator.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Allocator::deallocate()`].
    unsafe fn deallocate_typed<T: ?Sized>(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarding safety requirements from the caller.
        unsafe {
            self.deallocate(ptr.cast::<u8>().as_ptr());
        }
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

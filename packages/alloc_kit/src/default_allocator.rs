use crate::{Mallocator, Reporting};

/// The allocator used by [`UniquePtr::new()`][crate::UniquePtr::new] and
/// [`SharedPtr::new()`][crate::SharedPtr::new] when no allocator is injected.
pub type DefaultAllocator = Reporting<Mallocator>;

// Initialized at compile time and never torn down, so pointers that borrow it may live for the
// rest of the process.
static DEFAULT_ALLOCATOR: DefaultAllocator = Reporting::new(Mallocator::new());

/// The process-wide [`DefaultAllocator`] instance.
///
/// This is a reporting allocator over the platform heap, so every allocation made through it
/// is visible as a trace-level `tracing` event.
///
/// # Examples
///
/// ```
/// use alloc_kit::{AllocatorExt, default_allocator};
///
/// let allocator = default_allocator();
///
/// let value = allocator.allocate::<u64>(1).unwrap().unwrap();
///
/// // SAFETY: The pointer came from this allocator and holds no value that needs dropping.
/// unsafe { allocator.deallocate_typed(value) };
/// ```
#[must_use]
#[inline]
pub fn default_allocator() -> &'static DefaultAllocator {
    &DEFAULT_ALLOCATOR
}

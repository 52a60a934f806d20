use std::ffi::c_void;
use std::ptr::{self, NonNull};

use crate::{Allocator, Error, FailurePolicy, Result};

/// A heap allocator that honors the caller-specified alignment, using the platform
/// `posix_memalign()` facility.
///
/// The alignment must be a non-zero power of two. Requests with any other alignment are treated
/// as allocation failures and handled by the allocator's [failure policy][FailurePolicy], which
/// defaults to [`FailurePolicy::ReturnNull`].
///
/// # Examples
///
/// ```
/// use alloc_kit::{AlignedAllocator, Allocator};
///
/// let allocator = AlignedAllocator::new();
///
/// let ptr = allocator.allocate_raw(100, 64).unwrap().unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 64, 0);
///
/// // SAFETY: The pointer came from this allocator.
/// unsafe { allocator.deallocate(ptr.as_ptr()) };
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct AlignedAllocator {
    failure_policy: FailurePolicy,
}

impl AlignedAllocator {
    /// Creates an allocator with the default failure policy.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failure_policy: FailurePolicy::ReturnNull,
        }
    }

    /// Starts building an allocator with a custom configuration.
    pub fn builder() -> AlignedAllocatorBuilder {
        AlignedAllocatorBuilder::new()
    }

    /// The policy applied when a request cannot be satisfied.
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

impl Allocator for AlignedAllocator {
    fn allocate_raw(&self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>> {
        if !alignment.is_power_of_two() {
            return self
                .failure_policy
                .apply(Error::InvalidAlignment { alignment });
        }

        // posix_memalign() additionally requires a multiple of the pointer size, which any
        // power of two at least that large satisfies.
        let platform_alignment = alignment.max(size_of::<*mut c_void>());

        // A zero-sized request may legitimately return null, which we would mistake for failure.
        let platform_size = size.max(1);

        let mut ptr: *mut c_void = ptr::null_mut();

        // SAFETY: `ptr` is valid for writes and the alignment satisfies the platform contract.
        let status = unsafe { libc::posix_memalign(&raw mut ptr, platform_alignment, platform_size) };

        match NonNull::new(ptr.cast::<u8>()) {
            Some(ptr) if status == 0 => Ok(Some(ptr)),
            _ => self
                .failure_policy
                .apply(Error::OutOfMemory { size, alignment }),
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: The caller guarantees the pointer is null or came from posix_memalign(),
        // whose allocations are released via free().
        unsafe {
            libc::free(ptr.cast());
        }
    }
}

/// Builder for creating an instance of [`AlignedAllocator`].
///
/// You only need to use this builder if you want to customize the failure policy.
///
/// # Examples
///
/// ```
/// use alloc_kit::{AlignedAllocator, FailurePolicy};
///
/// let allocator = AlignedAllocator::builder()
///     .failure_policy(FailurePolicy::Panic)
///     .build();
///
/// assert_eq!(allocator.failure_policy(), FailurePolicy::Panic);
/// ```
#[derive(Debug)]
#[must_use]
pub struct AlignedAllocatorBuilder {
    failure_policy: FailurePolicy,
}

impl AlignedAllocatorBuilder {
    pub(crate) fn new() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Sets the [failure policy][FailurePolicy] of the allocator.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builds the allocator with the specified configuration.
    #[must_use]
    pub fn build(self) -> AlignedAllocator {
        AlignedAllocator {
            failure_policy: self.failure_policy,
        }
    }
}

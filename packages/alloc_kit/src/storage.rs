use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::any::type_name;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// Provides the contiguous buffer that backs a [`PoolAllocator`][crate::PoolAllocator].
///
/// The storage owns the buffer. The pool borrows it for each operation and never caches the
/// buffer address, so storage that lives inline in the pool may move together with the pool
/// while no allocations are outstanding.
///
/// # Safety
///
/// Implementations must guarantee that [`as_ptr()`][Self::as_ptr] returns a pointer that is
/// aligned for `T` and valid for reads and writes of [`capacity()`][Self::capacity] values of
/// `T` through a shared reference to the storage, for as long as the storage is neither moved
/// nor dropped. Every byte of the buffer must be initialized when the storage is created.
pub unsafe trait Storage<T> {
    /// The number of `T` elements the buffer can hold.
    fn capacity(&self) -> usize;

    /// Pointer to the first element of the buffer.
    fn as_ptr(&self) -> NonNull<T>;
}

/// Heap-allocated pool storage with a capacity chosen at runtime.
///
/// The buffer is allocated (zero-filled) when the storage is created and released when the
/// storage is dropped.
pub struct HeapStorage<T> {
    first_element_ptr: NonNull<T>,
    capacity: usize,
}

impl<T> HeapStorage<T> {
    /// Allocates a zero-filled buffer for `capacity` values of `T`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer would be zero-sized, either due to capacity or element size being
    /// zero, or if its size overflows `isize`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "HeapStorage must have non-zero capacity");
        assert!(
            size_of::<T>() > 0,
            "HeapStorage must have non-zero element size"
        );

        let layout = Self::layout(capacity);

        // SAFETY: The layout is valid for the element type and not zero-sized (guarded above).
        let ptr = unsafe { alloc_zeroed(layout) };

        let Some(first_element_ptr) = NonNull::new(ptr.cast::<T>()) else {
            handle_alloc_error(layout)
        };

        Self {
            first_element_ptr,
            capacity,
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::array::<T>(capacity).unwrap_or_else(|_| {
            panic!(
                "HeapStorage of {capacity} elements of {} overflows the address space",
                type_name::<T>()
            )
        })
    }
}

// SAFETY: The buffer is allocated for exactly `capacity` elements of T, aligned for T, zeroed on
// creation and lives until the storage is dropped. The heap address does not change on move.
unsafe impl<T> Storage<T> for HeapStorage<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn as_ptr(&self) -> NonNull<T> {
        self.first_element_ptr
    }
}

impl<T> Drop for HeapStorage<T> {
    fn drop(&mut self) {
        // SAFETY: The layout must match between alloc and dealloc. It does.
        unsafe {
            dealloc(
                self.first_element_ptr.as_ptr().cast(),
                Self::layout(self.capacity),
            );
        }
    }
}

impl<T> fmt::Debug for HeapStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapStorage")
            .field("element_type", &format_args!("{}", type_name::<T>()))
            .field("first_element_ptr", &self.first_element_ptr)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// SAFETY: The storage exclusively owns its buffer, so it can move between threads whenever the
// elements it holds can.
unsafe impl<T: Send> Send for HeapStorage<T> {}

/// Pool storage embedded directly in the owning value, with a capacity of `N` elements fixed at
/// compile time.
///
/// No separate allocation takes place. The buffer lives wherever the storage (and thus the pool
/// that owns it) lives, e.g. on the stack.
pub struct InlineStorage<T, const N: usize> {
    buffer: UnsafeCell<[MaybeUninit<T>; N]>,
}

impl<T, const N: usize> InlineStorage<T, N> {
    /// Creates a zero-filled buffer for `N` values of `T`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer would be zero-sized, either due to capacity or element size being
    /// zero.
    #[must_use]
    pub fn new() -> Self {
        assert!(N > 0, "InlineStorage must have non-zero capacity");
        assert!(
            size_of::<T>() > 0,
            "InlineStorage must have non-zero element size"
        );

        Self {
            buffer: UnsafeCell::new([const { MaybeUninit::zeroed() }; N]),
        }
    }
}

impl<T, const N: usize> Default for InlineStorage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The buffer is an array of exactly N elements of T, so it is aligned for T. It is
// zeroed on creation and wrapped in UnsafeCell, so writes through a shared reference are valid.
unsafe impl<T, const N: usize> Storage<T> for InlineStorage<T, N> {
    #[inline]
    fn capacity(&self) -> usize {
        N
    }

    #[inline]
    fn as_ptr(&self) -> NonNull<T> {
        // SAFETY: UnsafeCell::get() on a valid reference never returns null.
        unsafe { NonNull::new_unchecked(self.buffer.get().cast::<T>()) }
    }
}

impl<T, const N: usize> fmt::Debug for InlineStorage<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineStorage")
            .field("element_type", &format_args!("{}", type_name::<T>()))
            .field("capacity", &N)
            .finish_non_exhaustive()
    }
}

use std::any::type_name;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::{fmt, mem};

use scopeguard::ScopeGuard;

use crate::{Allocator, AllocatorExt, DefaultAllocator, Error, default_allocator};

/// A unique owner of one object placed in memory obtained from an injected [`Allocator`].
///
/// The pointer remembers the allocator that produced its storage and always releases the
/// storage through that same allocator, after dropping the object. The allocator is borrowed
/// for `'a`, so it cannot be destroyed while the pointer is alive.
///
/// A pointer is either empty or owns exactly one object. Only the construction functions on
/// this type can produce a non-empty pointer. If constructing the object fails (by returning an
/// error or by panicking), the storage is released before the failure reaches the caller.
///
/// Moving the pointer moves ownership. Use [`take()`][Self::take] to move ownership out of a
/// place while leaving an empty pointer behind. The pointer cannot be copied.
///
/// Pointers to a concrete type can be converted to pointers to a trait object via [`upcast!`].
///
/// # Examples
///
/// ```
/// use alloc_kit::{HeapPoolAllocator, UniquePtr};
///
/// let pool = HeapPoolAllocator::<String>::new(4);
///
/// let mut greeting = UniquePtr::new_in(String::from("hello"), &pool).unwrap();
/// greeting.push_str(" world");
///
/// assert_eq!(*greeting, "hello world");
/// assert_eq!(pool.slots_left(), 3);
///
/// greeting.clear();
/// assert!(greeting.is_empty());
/// assert_eq!(pool.slots_left(), 4);
/// ```
///
/// [`upcast!`]: crate::upcast
pub struct UniquePtr<'a, T: ?Sized, A: ?Sized + Allocator = DefaultAllocator> {
    owned: Option<Owned<'a, T, A>>,

    // We own a T and will drop it.
    _owns: PhantomData<T>,
}

struct Owned<'a, T: ?Sized, A: ?Sized> {
    object: NonNull<T>,
    allocator: &'a A,
}

impl<T> UniquePtr<'static, T> {
    /// Places `value` in storage obtained from the [default allocator][crate::default_allocator].
    ///
    /// Returns an empty pointer (dropping `value`) if the platform allocator is out of memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation size overflows the address space, or
    /// [`Error::InvalidAlignment`] if the type needs more alignment than `malloc()` provides.
    ///
    /// # Examples
    ///
    /// ```
    /// use alloc_kit::UniquePtr;
    ///
    /// let answer = UniquePtr::new(42).unwrap();
    ///
    /// assert_eq!(*answer, 42);
    /// ```
    pub fn new(value: T) -> Result<Self, Error> {
        Self::new_in(value, default_allocator())
    }
}

impl<'a, T, A: ?Sized + Allocator> UniquePtr<'a, T, A> {
    /// Places `value` in storage obtained from `allocator`.
    ///
    /// If the allocator yields no memory under [`FailurePolicy::ReturnNull`], `value` is dropped
    /// and an empty pointer is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator reports the failure as an error, or
    /// [`Error::InvalidAlignment`] if the allocator returned insufficiently aligned memory.
    ///
    /// [`FailurePolicy::ReturnNull`]: crate::FailurePolicy::ReturnNull
    pub fn new_in(value: T, allocator: &'a A) -> Result<Self, Error> {
        Self::new_with_in(allocator, || value)
    }

    /// Places the value returned by `init` in storage obtained from `allocator`.
    ///
    /// The storage is obtained before `init` is called, so the value is constructed only if
    /// there is somewhere to put it. If `init` panics, the storage is released before the
    /// panic propagates.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator reports the failure as an error, or
    /// [`Error::InvalidAlignment`] if the allocator returned insufficiently aligned memory.
    pub fn new_with_in<F>(allocator: &'a A, init: F) -> Result<Self, Error>
    where
        F: FnOnce() -> T,
    {
        Self::try_new_with_in(allocator, || Ok::<T, Error>(init()))
    }

    /// Places the value returned by a fallible `init` in storage obtained from `allocator`.
    ///
    /// The storage is obtained before `init` is called. If `init` returns an error or panics,
    /// the storage is released before the failure propagates.
    ///
    /// # Errors
    ///
    /// Returns the error from `init`, or an allocation error converted into `E`. Memory
    /// that is not aligned for the value is released and reported as
    /// [`Error::InvalidAlignment`].
    ///
    /// # Examples
    ///
    /// ```
    /// use alloc_kit::{Error, HeapPoolAllocator, UniquePtr};
    ///
    /// #[derive(Debug)]
    /// enum SetupError {
    ///     Allocation(Error),
    ///     Rejected,
    /// }
    ///
    /// impl From<Error> for SetupError {
    ///     fn from(e: Error) -> Self {
    ///         Self::Allocation(e)
    ///     }
    /// }
    ///
    /// let pool = HeapPoolAllocator::<u64>::new(1);
    ///
    /// let result = UniquePtr::try_new_with_in(&pool, || Err::<u64, _>(SetupError::Rejected));
    ///
    /// assert!(matches!(result, Err(SetupError::Rejected)));
    /// assert!(pool.is_empty());
    /// ```
    pub fn try_new_with_in<E, F>(allocator: &'a A, init: F) -> Result<Self, E>
    where
        E: From<Error>,
        F: FnOnce() -> Result<T, E>,
    {
        let Some(storage) = allocator.allocate::<T>(1)? else {
            return Ok(Self::empty());
        };

        // Until the value is in place, any exit from this function must return the storage.
        let guard = scopeguard::guard(storage, |storage| {
            // SAFETY: The storage came from this allocator and holds no value.
            unsafe {
                allocator.deallocate_typed(storage);
            }
        });

        // Allocators such as Mallocator do not enforce the requested alignment.
        if !guard.is_aligned() {
            return Err(Error::InvalidAlignment {
                alignment: align_of::<T>(),
            }
            .into());
        }

        let value = init()?;

        let storage = ScopeGuard::into_inner(guard);

        // SAFETY: The storage is valid for writes of one T, as promised by the allocator.
        unsafe {
            storage.write(value);
        }

        Ok(Self {
            owned: Some(Owned {
                object: storage,
                allocator,
            }),
            _owns: PhantomData,
        })
    }
}

impl<'a, T: ?Sized, A: ?Sized + Allocator> UniquePtr<'a, T, A> {
    /// Creates a pointer that owns nothing.
    #[must_use]
    #[inline]
    pub const fn empty() -> Self {
        Self {
            owned: None,
            _owns: PhantomData,
        }
    }

    /// Whether the pointer owns nothing.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owned.is_none()
    }

    /// The allocator that the owned object's storage came from, if any.
    #[must_use]
    #[inline]
    pub fn allocator(&self) -> Option<&'a A> {
        self.owned.as_ref().map(|owned| owned.allocator)
    }

    /// A reference to the owned object, if any.
    #[must_use]
    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.owned.as_ref().map(|owned| {
            // SAFETY: The object is alive for as long as we own it, and we are borrowed.
            unsafe { owned.object.as_ref() }
        })
    }

    /// An exclusive reference to the owned object, if any.
    #[must_use]
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.owned.as_mut().map(|owned| {
            // SAFETY: The object is alive for as long as we own it, and we are exclusively
            // borrowed.
            unsafe { owned.object.as_mut() }
        })
    }

    /// Moves ownership out of this pointer, leaving it empty.
    #[must_use]
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::replace(self, Self::empty())
    }

    /// Drops the owned object (if any) and releases its storage through the allocator that
    /// produced it, leaving the pointer empty.
    ///
    /// Calling this on an empty pointer does nothing.
    #[inline]
    pub fn clear(&mut self) {
        drop(self.take());
    }

    /// Converts this pointer into a pointer to the same object viewed as a different type.
    ///
    /// This method is only intended for use by the [`upcast!`] macro.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the provided closure returns a pointer to the same object
    /// it was given, differing only in pointer metadata.
    ///
    /// [`upcast!`]: crate::upcast
    #[doc(hidden)]
    #[must_use]
    #[inline]
    pub unsafe fn __private_cast_dyn_with_fn<U: ?Sized, F>(
        mut self,
        cast_fn: F,
    ) -> UniquePtr<'a, U, A>
    where
        F: FnOnce(*mut T) -> *mut U,
    {
        let Some(owned) = self.owned.take() else {
            return UniquePtr::empty();
        };

        let object = cast_fn(owned.object.as_ptr());

        UniquePtr {
            owned: Some(Owned {
                // SAFETY: The caller guarantees the cast preserves the address, which is not null.
                object: unsafe { NonNull::new_unchecked(object) },
                allocator: owned.allocator,
            }),
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Drop for UniquePtr<'_, T, A> {
    fn drop(&mut self) {
        let Some(owned) = self.owned.take() else {
            return;
        };

        // If dropping the object panics, the storage is still returned to the allocator.
        let _release = scopeguard::guard((), |()| {
            // SAFETY: The storage came from this allocator and the object in it is being (or
            // has been) dropped, never to be used again.
            unsafe {
                owned.allocator.deallocate_typed(owned.object);
            }
        });

        // SAFETY: We own the object and it is valid. Nobody can reference it after this.
        unsafe {
            owned.object.drop_in_place();
        }
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Deref for UniquePtr<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.get()
            .unwrap_or_else(|| panic!("dereferenced an empty UniquePtr of {}", type_name::<T>()))
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> DerefMut for UniquePtr<'_, T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
            .unwrap_or_else(|| panic!("dereferenced an empty UniquePtr of {}", type_name::<T>()))
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Default for UniquePtr<'_, T, A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized + fmt::Debug, A: ?Sized + Allocator> fmt::Debug for UniquePtr<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => f.debug_tuple("UniquePtr").field(&object).finish(),
            None => f.write_str("UniquePtr(<empty>)"),
        }
    }
}

// SAFETY: Moving the pointer to another thread moves the object with it (requiring T: Send) and
// lets that thread release the storage through a shared allocator reference (requiring A: Sync).
unsafe impl<T: ?Sized + Send, A: ?Sized + Allocator + Sync> Send for UniquePtr<'_, T, A> {}

// SAFETY: Shared access to the pointer only grants shared access to the object and allocator.
unsafe impl<T: ?Sized + Sync, A: ?Sized + Allocator + Sync> Sync for UniquePtr<'_, T, A> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::fmt::Display;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::LifetimeCounters;

    use super::*;
    use crate::{FailurePolicy, HeapPoolAllocator, Mallocator, MockAllocator, upcast};

    assert_impl_all!(UniquePtr<'static, u32>: Send, Sync);
    assert_impl_all!(UniquePtr<'static, dyn Display + Send + Sync, Mallocator>: Send, Sync);
    assert_not_impl_any!(UniquePtr<'static, Rc<u32>>: Send, Sync);
    assert_not_impl_any!(UniquePtr<'static, u32, HeapPoolAllocator<u32>>: Send, Sync);
    assert_not_impl_any!(UniquePtr<'static, u32>: Clone);

    /// A mock that serves every request from the platform allocator and expects exactly
    /// `allocations` allocations and as many deallocations.
    fn mock_allocator(allocations: usize) -> MockAllocator {
        let mut allocator = MockAllocator::new();

        allocator
            .expect_allocate_raw()
            .times(allocations)
            .returning(|size, alignment| Mallocator::new().allocate_raw(size, alignment));

        allocator.expect_deallocate().times(allocations).returning(|ptr| {
            // SAFETY: Every pointer handed to the mock came from a Mallocator, and Mallocator
            // instances are interchangeable.
            unsafe { Mallocator::new().deallocate(ptr) }
        });

        allocator
    }

    #[test]
    fn empty_pointer() {
        let ptr = UniquePtr::<u32>::empty();

        assert!(ptr.is_empty());
        assert!(ptr.get().is_none());
        assert!(ptr.allocator().is_none());
        assert!(UniquePtr::<u32>::default().is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn default_allocator_constructor() {
        let ptr = UniquePtr::new(7_u64).unwrap();

        assert!(!ptr.is_empty());
        assert_eq!(*ptr, 7);
        assert!(std::ptr::eq(ptr.allocator().unwrap(), default_allocator()));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn object_lifetime_follows_pointer() {
        let counters = LifetimeCounters::new();
        let allocator = mock_allocator(1);

        {
            let ptr = UniquePtr::new_in(counters.probe(), &allocator).unwrap();

            assert_eq!(counters.alive(), 1);
            assert!(std::ptr::eq(ptr.allocator().unwrap(), &allocator));
        }

        assert_eq!(counters.alive(), 0);
        assert_eq!(counters.dropped(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn clear_destroys_and_is_idempotent() {
        let counters = LifetimeCounters::new();
        let allocator = mock_allocator(1);

        let mut ptr = UniquePtr::new_in(counters.probe(), &allocator).unwrap();

        ptr.clear();
        assert!(ptr.is_empty());
        assert_eq!(counters.dropped(), 1);

        ptr.clear();
        assert_eq!(counters.dropped(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn take_moves_ownership() {
        let counters = LifetimeCounters::new();
        let allocator = mock_allocator(1);

        let mut source = UniquePtr::new_in(counters.probe(), &allocator).unwrap();
        let target = source.take();

        assert!(source.is_empty());
        assert!(!target.is_empty());
        assert_eq!(counters.alive(), 1);

        drop(source);
        assert_eq!(counters.alive(), 1);

        drop(target);
        assert_eq!(counters.alive(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn failed_init_releases_storage() {
        let counters = LifetimeCounters::new();
        let allocator = mock_allocator(1);

        let result = UniquePtr::try_new_with_in(&allocator, || {
            let _probe = counters.probe();
            Err::<u64, _>(Error::OutOfMemory {
                size: 1,
                alignment: 1,
            })
        });

        assert!(result.is_err());
        assert_eq!(counters.constructed(), 1);
        assert_eq!(counters.alive(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn panicking_init_releases_storage() {
        let allocator = mock_allocator(1);

        let result = catch_unwind(AssertUnwindSafe(|| {
            UniquePtr::new_with_in(&allocator, || -> u64 { panic!("constructor failed") })
        }));

        assert!(result.is_err());
        // The mock verifies on drop that exactly one deallocation took place.
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn panicking_drop_releases_storage() {
        struct PanicOnDrop;

        impl Drop for PanicOnDrop {
            fn drop(&mut self) {
                panic!("destructor failed");
            }
        }

        let allocator = mock_allocator(1);
        let ptr = UniquePtr::new_in(PanicOnDrop, &allocator).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| drop(ptr)));

        assert!(result.is_err());
    }

    #[test]
    fn init_not_called_without_storage() {
        let mut allocator = MockAllocator::new();
        allocator
            .expect_allocate_raw()
            .times(1)
            .returning(|_, _| Ok(None));
        allocator.expect_deallocate().never();

        let called = Cell::new(false);

        let ptr = UniquePtr::new_with_in(&allocator, || called.set(true)).unwrap();

        assert!(ptr.is_empty());
        assert!(!called.get());
    }

    #[test]
    fn allocation_error_is_converted() {
        let pool = HeapPoolAllocator::<u32>::builder()
            .capacity(1)
            .failure_policy(FailurePolicy::ReturnError)
            .build();

        let _first = UniquePtr::new_in(1_u32, &pool).unwrap();

        assert_eq!(
            UniquePtr::new_in(2_u32, &pool).unwrap_err(),
            Error::OutOfMemory {
                size: 4,
                alignment: 4
            }
        );
    }

    #[test]
    fn pool_backed_mutation() {
        let pool = HeapPoolAllocator::<Vec<u32>>::new(2);

        let mut list = UniquePtr::new_in(Vec::new(), &pool).unwrap();
        list.push(1);
        list.get_mut().unwrap().push(2);

        assert_eq!(list.get().unwrap().as_slice(), &[1, 2]);
        assert_eq!(pool.slots_left(), 1);

        drop(list);
        assert!(pool.is_empty());
    }

    trait Speaker {
        fn speak(&self) -> &'static str;
    }

    struct Base;

    impl Speaker for Base {
        fn speak(&self) -> &'static str {
            "base"
        }
    }

    struct Derived {
        _probe: testing::LifetimeProbe,
    }

    impl Speaker for Derived {
        fn speak(&self) -> &'static str {
            "derived"
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn upcast_dispatches_to_concrete_type() {
        let counters = LifetimeCounters::new();
        let pool = HeapPoolAllocator::<Derived>::new(1);

        let derived = UniquePtr::new_in(
            Derived {
                _probe: counters.probe(),
            },
            &pool,
        )
        .unwrap();

        let speaker: UniquePtr<'_, dyn Speaker, _> = upcast!(derived, dyn Speaker);
        assert_eq!(speaker.speak(), "derived");

        drop(speaker);
        assert_eq!(counters.alive(), 0);
        assert!(pool.is_empty());

        let allocator = Mallocator::new();
        let base = UniquePtr::new_in(Base, &allocator).unwrap();
        assert_eq!(base.speak(), "base");
    }

    #[test]
    fn upcast_of_empty_is_empty() {
        let empty = UniquePtr::<'_, Base, Mallocator>::empty();

        let speaker: UniquePtr<'_, dyn Speaker, _> = upcast!(empty, dyn Speaker);

        assert!(speaker.is_empty());
    }

    #[test]
    #[should_panic(expected = "empty UniquePtr")]
    fn deref_empty_panics() {
        let ptr = UniquePtr::<u32>::empty();

        let _value: u32 = *ptr;
    }

    #[test]
    fn debug_output() {
        let pool = HeapPoolAllocator::<u32>::new(1);
        let ptr = UniquePtr::new_in(5_u32, &pool).unwrap();

        assert_eq!(format!("{ptr:?}"), "UniquePtr(5)");
        assert_eq!(
            format!("{:?}", UniquePtr::<u32>::empty()),
            "UniquePtr(<empty>)"
        );
    }

    /// Hands out memory one byte past what `malloc()` returned, so nothing wider than a byte
    /// is aligned.
    fn misaligning_allocator() -> MockAllocator {
        let mut allocator = MockAllocator::new();

        allocator
            .expect_allocate_raw()
            .times(1)
            .returning(|size, alignment| {
                let ptr = Mallocator::new().allocate_raw(size + 1, alignment)?;

                Ok(ptr.map(|ptr| {
                    // SAFETY: We allocated one extra byte, so the offset stays in bounds.
                    unsafe { ptr.byte_add(1) }
                }))
            });

        allocator.expect_deallocate().times(1).returning(|ptr| {
            // SAFETY: Undoes the offset applied on allocation.
            unsafe { Mallocator::new().deallocate(ptr.wrapping_sub(1)) }
        });

        allocator
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
    fn misaligned_storage_is_released_and_rejected() {
        let allocator = misaligning_allocator();
        let called = Cell::new(false);

        let result = UniquePtr::new_with_in(&allocator, || {
            called.set(true);
            5_u64
        });

        assert_eq!(result.unwrap_err(), Error::InvalidAlignment { alignment: 8 });
        assert!(!called.get());
    }
}

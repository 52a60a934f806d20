use std::any::{TypeId, type_name};
use std::marker::PhantomData;
use std::mem::offset_of;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::{fmt, mem};

use scopeguard::ScopeGuard;

use crate::failure_policy::fatal;
use crate::{Allocator, AllocatorExt, DefaultAllocator, Error, default_allocator};

// Same limit as std::sync::Arc. A count this high means references are being leaked in a loop
// and continuing would eventually overflow into a use-after-free.
const MAX_REFERENCE_COUNT: usize = isize::MAX.unsigned_abs();

/// A reference-counted owner of one object placed in memory obtained from an injected
/// [`Allocator`].
///
/// The reference count and the object live together in a single allocation (the control
/// block). Cloning a pointer increments the count and dropping or [clearing][Self::clear] one
/// decrements it. The object is dropped, and the control block released through the allocator
/// that produced it, when the last pointer goes away. The allocator is borrowed for `'a`, so it
/// cannot be destroyed while any pointer is alive.
///
/// The reference count is atomic, so pointers to the same object may be cloned and dropped on
/// different threads if both the object and the allocator permit it. Access to the object itself
/// is shared and unsynchronized; use interior mutability with synchronization if you need to
/// mutate it.
///
/// Pointers to a concrete type can be converted to pointers to a trait object via [`upcast!`],
/// and back via [`downcast()`][Self::downcast], which checks the concrete type recorded in the
/// control block.
///
/// # Examples
///
/// ```
/// use alloc_kit::{ControlBlock, HeapPoolAllocator, SharedPtr};
///
/// let pool = HeapPoolAllocator::<ControlBlock<[u8; 8]>>::new(4);
///
/// let first = SharedPtr::new_in([1_u8; 8], &pool).unwrap();
/// let second = first.clone();
///
/// assert_eq!(first.reference_count(), 2);
/// assert!(SharedPtr::ptr_eq(&first, &second));
///
/// drop(first);
/// assert_eq!(second[7], 1);
/// assert_eq!(second.reference_count(), 1);
/// ```
///
/// [`upcast!`]: crate::upcast
pub struct SharedPtr<'a, T: ?Sized, A: ?Sized + Allocator = DefaultAllocator> {
    shared: Option<Shared<'a, T, A>>,

    // We (co-)own a T and may drop it.
    _owns: PhantomData<T>,
}

struct Shared<'a, T: ?Sized, A: ?Sized> {
    /// Start of the control block, which is also the address the allocator handed out.
    header: NonNull<Header>,

    /// The payload of the control block, possibly viewed as a trait object.
    object: NonNull<T>,

    allocator: &'a A,
}

/// The single allocation behind a [`SharedPtr<T>`], holding the reference count together with
/// the object.
///
/// The type is opaque. It is public so that a [`PoolAllocator`][crate::PoolAllocator] can be
/// sized to serve control blocks, by using it as the pool's element type.
// The header must come first so that every view of the control block finds it at the block's
// base address, whatever the payload type.
#[repr(C)]
pub struct ControlBlock<T> {
    header: Header,
    payload: T,
}

struct Header {
    reference_count: AtomicUsize,

    /// Concrete type of the payload, checked by downcasts.
    type_id: TypeId,

    /// Drops the payload in place. Does not release the control block.
    drop_payload: unsafe fn(NonNull<Header>),
}

/// # Safety
///
/// The header must be the start of a live `ControlBlock<T>` whose payload has not been dropped.
unsafe fn drop_payload<T>(header: NonNull<Header>) {
    let payload = payload_of(header.cast::<ControlBlock<T>>());

    // SAFETY: Forwarding guarantees from the caller.
    unsafe {
        payload.drop_in_place();
    }
}

fn payload_of<T>(block: NonNull<ControlBlock<T>>) -> NonNull<T> {
    // SAFETY: The payload field lies within the control block, so the offset stays in bounds.
    unsafe { block.byte_add(offset_of!(ControlBlock<T>, payload)) }.cast::<T>()
}

impl<T: 'static> SharedPtr<'static, T> {
    /// Places `value` in a control block obtained from the
    /// [default allocator][crate::default_allocator].
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
    /// use alloc_kit::SharedPtr;
    ///
    /// let name = SharedPtr::new(String::from("pool")).unwrap();
    /// let alias = name.clone();
    ///
    /// assert_eq!(*alias, "pool");
    /// ```
    pub fn new(value: T) -> Result<Self, Error> {
        Self::new_in(value, default_allocator())
    }
}

impl<'a, T: 'static, A: ?Sized + Allocator> SharedPtr<'a, T, A> {
    /// Places `value` in a control block obtained from `allocator`.
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

    /// Places the value returned by `init` in a control block obtained from `allocator`.
    ///
    /// The control block is obtained before `init` is called. If `init` panics, the control
    /// block is released before the panic propagates.
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

    /// Places the value returned by a fallible `init` in a control block obtained from
    /// `allocator`.
    ///
    /// The control block is obtained before `init` is called. If `init` returns an error or
    /// panics, the control block is released before the failure propagates.
    ///
    /// # Errors
    ///
    /// Returns the error from `init`, or an allocation error converted into `E`. Memory
    /// that is not aligned for the value is released and reported as
    /// [`Error::InvalidAlignment`].
    pub fn try_new_with_in<E, F>(allocator: &'a A, init: F) -> Result<Self, E>
    where
        E: From<Error>,
        F: FnOnce() -> Result<T, E>,
    {
        let Some(block) = allocator.allocate::<ControlBlock<T>>(1)? else {
            return Ok(Self::empty());
        };

        // Until the payload is in place, any exit from this function must return the block.
        let guard = scopeguard::guard(block, |block| {
            // SAFETY: The block came from this allocator and holds no value.
            unsafe {
                allocator.deallocate_typed(block);
            }
        });

        // Allocators such as Mallocator do not enforce the requested alignment.
        if !guard.is_aligned() {
            return Err(Error::InvalidAlignment {
                alignment: align_of::<ControlBlock<T>>(),
            }
            .into());
        }

        let payload = init()?;

        let block = ScopeGuard::into_inner(guard);

        // SAFETY: The block is valid for writes of one ControlBlock<T>, as promised by the
        // allocator.
        unsafe {
            block.write(ControlBlock {
                header: Header {
                    reference_count: AtomicUsize::new(1),
                    type_id: TypeId::of::<T>(),
                    drop_payload: drop_payload::<T>,
                },
                payload,
            });
        }

        let object = payload_of(block);

        Ok(Self {
            shared: Some(Shared {
                header: block.cast(),
                object,
                allocator,
            }),
            _owns: PhantomData,
        })
    }
}

impl<'a, T: ?Sized, A: ?Sized + Allocator> SharedPtr<'a, T, A> {
    /// Creates a pointer that references nothing.
    #[must_use]
    #[inline]
    pub const fn empty() -> Self {
        Self {
            shared: None,
            _owns: PhantomData,
        }
    }

    /// Whether the pointer references nothing.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shared.is_none()
    }

    /// The allocator that the control block came from, if any.
    #[must_use]
    #[inline]
    pub fn allocator(&self) -> Option<&'a A> {
        self.shared.as_ref().map(|shared| shared.allocator)
    }

    /// A reference to the shared object, if any.
    #[must_use]
    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.shared.as_ref().map(|shared| {
            // SAFETY: The object is alive as long as any pointer references it, and we are
            // borrowed. Only shared references to it are ever created.
            unsafe { shared.object.as_ref() }
        })
    }

    /// The number of pointers referencing the same control block, or zero if empty.
    ///
    /// Other threads may change the count at any time, so the value is only a snapshot.
    #[must_use]
    #[inline]
    pub fn reference_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |shared| {
            shared.header().reference_count.load(Ordering::Relaxed)
        })
    }

    /// Whether two pointers reference the same control block.
    ///
    /// Two empty pointers are considered equal.
    #[must_use]
    #[inline]
    pub fn ptr_eq<U: ?Sized>(this: &Self, other: &SharedPtr<'_, U, A>) -> bool {
        this.shared.as_ref().map(|shared| shared.header)
            == other.shared.as_ref().map(|shared| shared.header)
    }

    /// Moves this reference out of the pointer, leaving it empty. The count is unchanged.
    #[must_use]
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::replace(self, Self::empty())
    }

    /// Releases this reference, leaving the pointer empty.
    ///
    /// If this was the last reference, the object is dropped and the control block is released
    /// through the allocator that produced it. Calling this on an empty pointer does nothing.
    #[inline]
    pub fn clear(&mut self) {
        drop(self.take());
    }

    /// Creates a new reference to the same control block, viewing the object as `U`, if `U` is
    /// the concrete type the object was created with.
    ///
    /// Returns an empty pointer (leaving the count unchanged) if the type does not match or
    /// this pointer is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::fmt::Display;
    ///
    /// use alloc_kit::{SharedPtr, upcast};
    ///
    /// let number = SharedPtr::new(42_u32).unwrap();
    /// let display: SharedPtr<dyn Display> = upcast!(number.clone(), dyn Display);
    ///
    /// assert!(display.downcast::<String>().is_empty());
    ///
    /// let back = display.downcast::<u32>();
    /// assert_eq!(*back, 42);
    /// assert_eq!(number.reference_count(), 3);
    /// ```
    #[must_use]
    pub fn downcast<U: 'static>(&self) -> SharedPtr<'a, U, A> {
        let Some(shared) = self.shared.as_ref() else {
            return SharedPtr::empty();
        };

        if shared.header().type_id != TypeId::of::<U>() {
            return SharedPtr::empty();
        }

        shared.retain();

        // The type check above proves the block is a ControlBlock<U>.
        let object = payload_of(shared.header.cast::<ControlBlock<U>>());

        SharedPtr {
            shared: Some(Shared {
                header: shared.header,
                object,
                allocator: shared.allocator,
            }),
            _owns: PhantomData,
        }
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
    ) -> SharedPtr<'a, U, A>
    where
        F: FnOnce(*mut T) -> *mut U,
    {
        // Ownership of our reference moves to the new pointer, so the count stays as it is.
        let Some(shared) = self.shared.take() else {
            return SharedPtr::empty();
        };

        let object = cast_fn(shared.object.as_ptr());

        SharedPtr {
            shared: Some(Shared {
                header: shared.header,
                // SAFETY: The caller guarantees the cast preserves the address, which is not null.
                object: unsafe { NonNull::new_unchecked(object) },
                allocator: shared.allocator,
            }),
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized, A: ?Sized> Shared<'_, T, A> {
    fn header(&self) -> &Header {
        // SAFETY: The header is alive as long as any pointer references the control block.
        unsafe { self.header.as_ref() }
    }

    fn retain(&self) {
        // A new reference can only be created from an existing one, which keeps the block alive
        // and provides all the synchronization we need, so relaxed ordering suffices.
        let previous = self
            .header()
            .reference_count
            .fetch_add(1, Ordering::Relaxed);

        if previous >= MAX_REFERENCE_COUNT {
            fatal(format_args!(
                "SharedPtr of {} reference count overflow",
                type_name::<T>()
            ));
        }
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Clone for SharedPtr<'_, T, A> {
    fn clone(&self) -> Self {
        if let Some(shared) = self.shared.as_ref() {
            shared.retain();
        }

        Self {
            shared: self.shared.as_ref().map(|shared| Shared {
                header: shared.header,
                object: shared.object,
                allocator: shared.allocator,
            }),
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Drop for SharedPtr<'_, T, A> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        // Release makes our uses of the object happen-before the final drop on whichever
        // thread observes the count reaching zero.
        if shared
            .header()
            .reference_count
            .fetch_sub(1, Ordering::Release)
            != 1
        {
            return;
        }

        // Pairs with the Release above on every other thread that dropped a reference.
        atomic::fence(Ordering::Acquire);

        // If dropping the payload panics, the block is still returned to the allocator.
        let _release = scopeguard::guard((), |()| {
            // SAFETY: The block came from this allocator and we were its last reference.
            unsafe {
                shared.allocator.deallocate_typed(shared.header);
            }
        });

        let drop_payload = shared.header().drop_payload;

        // SAFETY: We were the last reference, so the payload is alive and nobody else can
        // observe it anymore.
        unsafe {
            drop_payload(shared.header);
        }
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Deref for SharedPtr<'_, T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.get()
            .unwrap_or_else(|| panic!("dereferenced an empty SharedPtr of {}", type_name::<T>()))
    }
}

impl<T: ?Sized, A: ?Sized + Allocator> Default for SharedPtr<'_, T, A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for ControlBlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("payload_type", &format_args!("{}", type_name::<T>()))
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + fmt::Debug, A: ?Sized + Allocator> fmt::Debug for SharedPtr<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => f.debug_tuple("SharedPtr").field(&object).finish(),
            None => f.write_str("SharedPtr(<empty>)"),
        }
    }
}

// SAFETY: Any clone may drop the object on any thread and any clone grants shared access to it,
// so the object must be Send + Sync, like Arc<T>. Every clone may release the control block
// through a shared allocator reference, so the allocator must be Sync.
unsafe impl<T: ?Sized + Send + Sync, A: ?Sized + Allocator + Sync> Send for SharedPtr<'_, T, A> {}

// SAFETY: See Send. A shared reference to the pointer can be used to clone it.
unsafe impl<T: ?Sized + Send + Sync, A: ?Sized + Allocator + Sync> Sync for SharedPtr<'_, T, A> {}

use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use num_integer::Integer;
use tracing::debug;

use crate::failure_policy::fatal;
use crate::{
    Allocator, Error, FailurePolicy, HeapStorage, InlineStorage, Result, Storage,
};

/// A fixed-capacity allocator that hands out contiguous runs of `T`-sized slots from a buffer
/// supplied by a [`Storage`] provider.
///
/// Every request must be for a whole number of `T` elements. A request for `n` elements is
/// placed at the first run of `n` contiguous free slots, scanning from the start of the buffer.
/// Free runs are discovered at allocation time: deallocation only marks slots as free, without
/// any coalescing bookkeeping. The pool does not defragment itself, so a request can fail even
/// if enough slots are free in total when no single free run is long enough.
///
/// Deallocation zero-fills the released range, so stale reads through a dangling pointer
/// observe zeros instead of the previous value.
///
/// Requests the pool cannot satisfy are handled by its [failure policy][FailurePolicy], which
/// defaults to [`FailurePolicy::Panic`] for pools. Deallocating an address outside the buffer,
/// or one that is not the start of a live allocation, is a fatal error regardless of the policy.
///
/// The pool tracks its slots without synchronization and is therefore not `Sync`.
///
/// Use one of the storage-specific aliases to create a pool:
///
/// * [`HeapPoolAllocator`] - the buffer is heap-allocated with a capacity chosen at runtime.
/// * [`InlinePoolAllocator`] - the buffer is embedded in the pool with a compile-time capacity.
///
/// # Examples
///
/// ```
/// use alloc_kit::{AllocatorExt, HeapPoolAllocator};
///
/// let pool = HeapPoolAllocator::<u64>::new(8);
///
/// let first = pool.allocate::<u64>(3).unwrap().unwrap();
/// let second = pool.allocate::<u64>(2).unwrap().unwrap();
/// assert_eq!(pool.slots_left(), 3);
///
/// // SAFETY: Both pointers came from this pool and hold no values that need dropping.
/// unsafe {
///     pool.deallocate_typed(first);
///     pool.deallocate_typed(second);
/// }
/// assert_eq!(pool.slots_left(), 8);
/// ```
pub struct PoolAllocator<T, S: Storage<T>> {
    storage: S,

    /// One entry per element of the buffer. The entry at the start of an allocated run is the
    /// head of the run and records how many elements the run owns.
    slots: Box<[Cell<Slot>]>,

    slots_left: Cell<usize>,

    failure_policy: FailurePolicy,

    _element: PhantomData<T>,
}

/// A pool allocator whose buffer is heap-allocated with a capacity chosen at runtime.
pub type HeapPoolAllocator<T> = PoolAllocator<T, HeapStorage<T>>;

/// A pool allocator whose buffer of `N` elements is embedded in the allocator itself.
pub type InlinePoolAllocator<T, const N: usize> = PoolAllocator<T, InlineStorage<T, N>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Slot {
    /// Number of elements owned by the run that starts at this slot. Zero unless this slot is
    /// the head of an allocated run.
    elements_owned: usize,

    free: bool,
}

impl Slot {
    const FREE: Self = Self {
        elements_owned: 0,
        free: true,
    };

    const CONTINUATION: Self = Self {
        elements_owned: 0,
        free: false,
    };

    const fn head(elements_owned: usize) -> Self {
        Self {
            elements_owned,
            free: false,
        }
    }
}

impl<T, S: Storage<T>> PoolAllocator<T, S> {
    /// Creates a pool over the buffer of an existing storage provider.
    ///
    /// # Panics
    ///
    /// Panics if the storage has zero capacity or `T` is zero-sized.
    #[must_use]
    pub fn from_storage(storage: S, failure_policy: FailurePolicy) -> Self {
        let capacity = storage.capacity();

        assert!(capacity > 0, "PoolAllocator must have non-zero capacity");
        assert!(
            size_of::<T>() > 0,
            "PoolAllocator must have non-zero element size"
        );

        debug!(
            capacity,
            element_type = type_name::<T>(),
            ?failure_policy,
            "created pool allocator"
        );

        Self {
            storage,
            slots: (0..capacity).map(|_| Cell::new(Slot::FREE)).collect(),
            slots_left: Cell::new(capacity),
            failure_policy,
            _element: PhantomData,
        }
    }

    /// The total number of elements the pool can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of elements not currently allocated.
    ///
    /// These are not necessarily contiguous, so a request for this many elements may still fail.
    #[must_use]
    pub fn slots_left(&self) -> usize {
        self.slots_left.get()
    }

    /// Whether no elements are currently allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots_left() == self.capacity()
    }

    /// Whether every element is currently allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots_left() == 0
    }

    /// The policy applied when a request cannot be satisfied.
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn slot(&self, index: usize) -> &Cell<Slot> {
        self.slots.get(index).unwrap_or_else(|| {
            panic!(
                "slot {index} out of bounds in pool of {} with capacity {}",
                type_name::<T>(),
                self.capacity()
            )
        })
    }

    /// Finds the index of the first run of `count` contiguous free slots.
    #[expect(
        clippy::arithmetic_side_effects,
        reason = "all indexes are bounded by capacity, which is a slice length"
    )]
    fn find_free_run(&self, count: usize) -> Option<usize> {
        if count > self.slots_left() {
            return None;
        }

        let capacity = self.capacity();
        let mut index = 0;

        while index < capacity {
            if !self.slot(index).get().free {
                index += 1;
                continue;
            }

            let start = index;
            let mut end = start + 1;

            while end < capacity && end - start < count && self.slot(end).get().free {
                end += 1;
            }

            if end - start == count {
                return Some(start);
            }

            // Everything in [start, end) is free but too short, and `end` is either occupied
            // or out of bounds, so the search continues after it.
            index = end;
        }

        None
    }

    #[expect(
        clippy::arithmetic_side_effects,
        reason = "the run was found within capacity and count <= slots_left"
    )]
    fn claim(&self, start: usize, count: usize) -> NonNull<T> {
        self.slot(start).set(Slot::head(count));

        for index in start + 1..start + count {
            self.slot(index).set(Slot::CONTINUATION);
        }

        self.slots_left.set(self.slots_left() - count);

        // SAFETY: `start` is within capacity, so the offset stays within the buffer.
        unsafe { self.storage.as_ptr().add(start) }
    }

    /// Converts an address handed out by this pool back into an element index.
    ///
    /// Any address that is not the start of an element inside the buffer is fatal.
    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        let buffer_start = self.storage.as_ptr().addr().get();

        let (index, misalignment) = ptr
            .addr()
            .get()
            .wrapping_sub(buffer_start)
            .div_rem(&size_of::<T>());

        if misalignment != 0 || index >= self.capacity() {
            fatal(format_args!(
                "PoolAllocator of {} tried to deallocate address {ptr:?} out of range",
                type_name::<T>()
            ));
        }

        index
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    fn integrity_check(&self) {
        let mut owned_elements: usize = 0;
        let mut continuations_expected: usize = 0;

        for index in 0..self.capacity() {
            let slot = self.slot(index).get();

            if continuations_expected > 0 {
                assert!(
                    slot == Slot::CONTINUATION,
                    "slot {index} should continue a run but is {slot:?} in pool of {}",
                    type_name::<T>()
                );

                continuations_expected = continuations_expected
                    .checked_sub(1)
                    .expect("guarded by the > 0 check above");
                continue;
            }

            if slot.free {
                assert!(
                    slot.elements_owned == 0,
                    "free slot {index} owns elements in pool of {}",
                    type_name::<T>()
                );
                continue;
            }

            assert!(
                slot.elements_owned > 0,
                "slot {index} is a continuation without a head in pool of {}",
                type_name::<T>()
            );

            owned_elements = owned_elements
                .checked_add(slot.elements_owned)
                .expect("owned elements never exceed capacity");
            continuations_expected = slot
                .elements_owned
                .checked_sub(1)
                .expect("guarded by the > 0 assertion above");
        }

        assert!(
            continuations_expected == 0,
            "last run extends beyond capacity in pool of {}",
            type_name::<T>()
        );

        assert!(
            owned_elements.checked_add(self.slots_left()) == Some(self.capacity()),
            "owned elements {owned_elements} plus slots left {} do not add up to capacity {} in pool of {}",
            self.slots_left(),
            self.capacity(),
            type_name::<T>()
        );
    }
}

impl<T, S: Storage<T>> Allocator for PoolAllocator<T, S> {
    fn allocate_raw(&self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>> {
        #[cfg(debug_assertions)]
        self.integrity_check();

        if !alignment.is_power_of_two() || alignment > align_of::<T>() {
            return self
                .failure_policy
                .apply(Error::InvalidAlignment { alignment });
        }

        let (count, remainder) = size.div_rem(&size_of::<T>());

        // Zero-sized and partial-element requests have no well-defined element count.
        if count == 0 || remainder != 0 {
            return self
                .failure_policy
                .apply(Error::OutOfMemory { size, alignment });
        }

        match self.find_free_run(count) {
            Some(start) => Ok(Some(self.claim(start, count).cast())),
            None => self
                .failure_policy
                .apply(Error::OutOfMemory { size, alignment }),
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let index = self.index_of(ptr);
        let head = self.slot(index).get();

        if head.free || head.elements_owned == 0 {
            fatal(format_args!(
                "PoolAllocator of {} tried to deallocate address {ptr:?} (slot {index}) which is not the start of a live allocation",
                type_name::<T>()
            ));
        }

        // SAFETY: `index` is within capacity and the run of `elements_owned` elements was
        // claimed within capacity, so the whole range is inside the buffer.
        unsafe {
            self.storage
                .as_ptr()
                .add(index)
                .write_bytes(0, head.elements_owned);
        }

        for slot in self
            .slots
            .iter()
            .skip(index)
            .take(head.elements_owned)
        {
            slot.set(Slot::FREE);
        }

        self.slots_left.set(
            self.slots_left()
                .checked_add(head.elements_owned)
                .expect("released elements were previously subtracted from slots left"),
        );
    }
}

impl<T> PoolAllocator<T, HeapStorage<T>> {
    /// Creates a pool with a heap-allocated buffer of `capacity` elements and the default
    /// pool failure policy ([`FailurePolicy::Panic`]).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `T` is zero-sized.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::builder().capacity(capacity).build()
    }

    /// Starts building a heap-backed pool with a custom configuration.
    pub fn builder() -> HeapPoolAllocatorBuilder<T> {
        HeapPoolAllocatorBuilder::new()
    }
}

impl<T, const N: usize> PoolAllocator<T, InlineStorage<T, N>> {
    /// Creates a pool with an inline buffer of `N` elements and the default pool failure
    /// policy ([`FailurePolicy::Panic`]).
    ///
    /// # Panics
    ///
    /// Panics if `N` is zero or `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building an inline pool with a custom configuration.
    pub fn builder() -> InlinePoolAllocatorBuilder<T, N> {
        InlinePoolAllocatorBuilder::new()
    }
}

impl<T, const N: usize> Default for PoolAllocator<T, InlineStorage<T, N>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: Storage<T> + fmt::Debug> fmt::Debug for PoolAllocator<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("element_type", &format_args!("{}", type_name::<T>()))
            .field("storage", &self.storage)
            .field("capacity", &self.capacity())
            .field("slots_left", &self.slots_left())
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

/// Builder for creating an instance of [`HeapPoolAllocator`].
///
/// The capacity must be set before building.
///
/// # Examples
///
/// ```
/// use alloc_kit::{FailurePolicy, HeapPoolAllocator};
///
/// let pool = HeapPoolAllocator::<u32>::builder()
///     .capacity(16)
///     .failure_policy(FailurePolicy::ReturnNull)
///     .build();
///
/// assert_eq!(pool.capacity(), 16);
/// ```
#[must_use]
pub struct HeapPoolAllocatorBuilder<T> {
    capacity: Option<usize>,
    failure_policy: FailurePolicy,

    _element: PhantomData<T>,
}

impl<T> fmt::Debug for HeapPoolAllocatorBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapPoolAllocatorBuilder")
            .field("element_type", &format_args!("{}", type_name::<T>()))
            .field("capacity", &self.capacity)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl<T> HeapPoolAllocatorBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            capacity: None,
            failure_policy: FailurePolicy::Panic,
            _element: PhantomData,
        }
    }

    /// Sets the number of `T` elements the pool can hold.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the [failure policy][FailurePolicy] of the pool.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if the capacity was not set, is zero, or `T` is zero-sized.
    #[must_use]
    pub fn build(self) -> HeapPoolAllocator<T> {
        let capacity = self.capacity.unwrap_or_else(|| {
            panic!(
                "capacity must be set before building a HeapPoolAllocator of {}",
                type_name::<T>()
            )
        });

        PoolAllocator::from_storage(HeapStorage::new(capacity), self.failure_policy)
    }
}

/// Builder for creating an instance of [`InlinePoolAllocator`].
///
/// # Examples
///
/// ```
/// use alloc_kit::{FailurePolicy, InlinePoolAllocator};
///
/// let pool = InlinePoolAllocator::<u32, 16>::builder()
///     .failure_policy(FailurePolicy::ReturnError)
///     .build();
///
/// assert_eq!(pool.capacity(), 16);
/// ```
#[must_use]
pub struct InlinePoolAllocatorBuilder<T, const N: usize> {
    failure_policy: FailurePolicy,

    _element: PhantomData<T>,
}

impl<T, const N: usize> fmt::Debug for InlinePoolAllocatorBuilder<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlinePoolAllocatorBuilder")
            .field("element_type", &format_args!("{}", type_name::<T>()))
            .field("capacity", &N)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl<T, const N: usize> InlinePoolAllocatorBuilder<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            failure_policy: FailurePolicy::Panic,
            _element: PhantomData,
        }
    }

    /// Sets the [failure policy][FailurePolicy] of the pool.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if `N` is zero or `T` is zero-sized.
    #[must_use]
    pub fn build(self) -> InlinePoolAllocator<T, N> {
        PoolAllocator::from_storage(InlineStorage::new(), self.failure_policy)
    }
}

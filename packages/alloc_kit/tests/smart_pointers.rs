//! Integration tests for the smart pointers, checking that memory always goes back to the
//! allocator it came from.

use std::cell::Cell;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::thread;

use alloc_kit::{
    AlignedAllocator, Allocator, ControlBlock, Error, FailurePolicy, HeapPoolAllocator,
    InlinePoolAllocator, Mallocator, SharedPtr, UniquePtr, upcast,
};
use testing::{LifetimeCounters, LifetimeProbe, with_watchdog};

/// Forwards to an inner allocator while counting calls.
#[derive(Debug)]
struct CountingAllocator<A> {
    inner: A,
    allocations: Cell<usize>,
    deallocations: Cell<usize>,
}

impl<A> CountingAllocator<A> {
    fn new(inner: A) -> Self {
        Self {
            inner,
            allocations: Cell::new(0),
            deallocations: Cell::new(0),
        }
    }

    fn allocations(&self) -> usize {
        self.allocations.get()
    }

    fn deallocations(&self) -> usize {
        self.deallocations.get()
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate_raw(&self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>, Error> {
        self.allocations.set(self.allocations.get() + 1);
        self.inner.allocate_raw(size, alignment)
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        self.deallocations.set(self.deallocations.get() + 1);

        // SAFETY: Forwarding safety requirements from the caller.
        unsafe {
            self.inner.deallocate(ptr);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SetupError {
    Allocation(Error),
    Rejected,
}

impl From<Error> for SetupError {
    fn from(e: Error) -> Self {
        Self::Allocation(e)
    }
}

#[test]
fn unique_constructor_failure_releases_exactly_once() {
    let allocator = CountingAllocator::new(HeapPoolAllocator::<u64>::new(1));

    let result = UniquePtr::try_new_with_in(&allocator, || Err::<u64, _>(SetupError::Rejected));

    assert_eq!(result.unwrap_err(), SetupError::Rejected);
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(allocator.deallocations(), 1);
    assert!(allocator.inner.is_empty());
}

#[test]
fn shared_constructor_failure_releases_exactly_once() {
    let allocator = CountingAllocator::new(HeapPoolAllocator::<ControlBlock<u64>>::new(1));

    let result = SharedPtr::try_new_with_in(&allocator, || Err::<u64, _>(SetupError::Rejected));

    assert_eq!(result.unwrap_err(), SetupError::Rejected);
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(allocator.deallocations(), 1);
    assert!(allocator.inner.is_empty());
}

#[test]
fn constructor_panic_releases_exactly_once() {
    let unique_allocator = CountingAllocator::new(HeapPoolAllocator::<u64>::new(1));
    let shared_allocator = CountingAllocator::new(HeapPoolAllocator::<ControlBlock<u64>>::new(1));

    let unique = catch_unwind(AssertUnwindSafe(|| {
        UniquePtr::new_with_in(&unique_allocator, || -> u64 { panic!("constructor failed") })
    }));
    let shared = catch_unwind(AssertUnwindSafe(|| {
        SharedPtr::new_with_in(&shared_allocator, || -> u64 { panic!("constructor failed") })
    }));

    assert!(unique.is_err());
    assert!(shared.is_err());

    for allocator_counts in [
        (unique_allocator.allocations(), unique_allocator.deallocations()),
        (shared_allocator.allocations(), shared_allocator.deallocations()),
    ] {
        assert_eq!(allocator_counts, (1, 1));
    }
}

#[test]
fn allocation_failure_reaches_caller_error_type() {
    let pool = HeapPoolAllocator::<u64>::builder()
        .capacity(1)
        .failure_policy(FailurePolicy::ReturnError)
        .build();

    let _occupant = UniquePtr::new_in(1_u64, &pool).unwrap();

    let called = Cell::new(false);
    let result = UniquePtr::try_new_with_in(&pool, || {
        called.set(true);
        Ok::<_, SetupError>(2_u64)
    });

    assert_eq!(
        result.unwrap_err(),
        SetupError::Allocation(Error::OutOfMemory {
            size: 8,
            alignment: 8
        })
    );
    assert!(!called.get());
}

#[test]
fn shared_copies_destroy_once_on_final_clear() {
    const COPIES: usize = 16;

    let counters = LifetimeCounters::new();
    let allocator = CountingAllocator::new(InlinePoolAllocator::<ControlBlock<LifetimeProbe>, 2>::new());

    let mut copies = vec![SharedPtr::new_in(counters.probe(), &allocator).unwrap()];

    for _ in 1..COPIES {
        let copy = copies[0].clone();
        copies.push(copy);
    }

    assert_eq!(copies[0].reference_count(), COPIES);

    while let Some(mut copy) = copies.pop() {
        assert_eq!(counters.alive(), 1);
        assert_eq!(allocator.deallocations(), 0);

        copy.clear();
    }

    assert_eq!(counters.constructed(), 1);
    assert_eq!(counters.dropped(), 1);
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(allocator.deallocations(), 1);
    assert!(allocator.inner.is_empty());
}

trait Shape {
    fn area(&self) -> u32;
}

#[derive(Debug)]
struct Square {
    side: u32,
    _probe: LifetimeProbe,
}

impl Shape for Square {
    fn area(&self) -> u32 {
        self.side * self.side
    }
}

#[derive(Debug)]
struct Rectangle {
    width: u32,
    height: u32,
    _probe: LifetimeProbe,
}

impl Shape for Rectangle {
    fn area(&self) -> u32 {
        self.width * self.height
    }
}

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn heterogeneous_shapes_share_one_allocator() {
    let counters = LifetimeCounters::new();
    let allocator = CountingAllocator::new(Mallocator::new());

    let square = SharedPtr::new_in(
        Square {
            side: 3,
            _probe: counters.probe(),
        },
        &allocator,
    )
    .unwrap();
    let rectangle = SharedPtr::new_in(
        Rectangle {
            width: 2,
            height: 5,
            _probe: counters.probe(),
        },
        &allocator,
    )
    .unwrap();

    let shapes: Vec<SharedPtr<'_, dyn Shape, _>> = vec![
        upcast!(square.clone(), dyn Shape),
        upcast!(rectangle, dyn Shape),
    ];

    assert_eq!(shapes.iter().map(|shape| shape.area()).sum::<u32>(), 19);

    let squares: Vec<_> = shapes
        .iter()
        .map(|shape| shape.downcast::<Square>())
        .filter(|square| !square.is_empty())
        .collect();

    assert_eq!(squares.len(), 1);
    assert_eq!(squares[0].side, 3);
    assert!(SharedPtr::ptr_eq(&squares[0], &square));
    assert_eq!(square.reference_count(), 3);

    drop(squares);
    drop(shapes);
    assert_eq!(counters.alive(), 1);
    assert_eq!(allocator.deallocations(), 1);

    drop(square);
    assert_eq!(counters.alive(), 0);
    assert_eq!(allocator.allocations(), 2);
    assert_eq!(allocator.deallocations(), 2);
}

#[test]
fn unique_upcast_keeps_allocator() {
    let counters = LifetimeCounters::new();
    let pool = HeapPoolAllocator::<Square>::new(2);

    let square = UniquePtr::new_in(
        Square {
            side: 4,
            _probe: counters.probe(),
        },
        &pool,
    )
    .unwrap();

    let shape: UniquePtr<'_, dyn Shape, _> = upcast!(square, dyn Shape);

    assert_eq!(shape.area(), 16);
    assert!(std::ptr::eq(shape.allocator().unwrap(), &pool));
    assert_eq!(pool.slots_left(), 1);

    drop(shape);
    assert_eq!(counters.alive(), 0);
    assert!(pool.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn unique_pointer_moves_between_threads() {
    with_watchdog(|| {
        let mut ptr: UniquePtr<'static, dyn Display + Send + Sync> =
            upcast!(UniquePtr::new(String::from("moved")).unwrap(), dyn Display + Send + Sync);

        let text = thread::spawn(move || {
            let text = ptr.to_string();
            ptr.clear();
            text
        })
        .join()
        .unwrap();

        assert_eq!(text, "moved");
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn shared_pointer_last_drop_on_other_thread() {
    with_watchdog(|| {
        let counters = LifetimeCounters::new();
        let original = SharedPtr::new(counters.probe()).unwrap();

        let copies: Vec<_> = (0..4).map(|_| original.clone()).collect();
        drop(original);

        let handles: Vec<_> = copies
            .into_iter()
            .map(|copy| thread::spawn(move || drop(copy)))
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.dropped(), 1);
        assert_eq!(counters.alive(), 0);
    });
}

#[derive(Debug)]
#[repr(align(4096))]
struct PageAligned(u8);

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn over_aligned_payload_is_aligned_or_rejected() {
    let expected_error = Error::InvalidAlignment { alignment: 4096 };

    for _ in 0..16 {
        match UniquePtr::new(PageAligned(1)) {
            Ok(ptr) => {
                assert!(std::ptr::from_ref(ptr.get().unwrap()).is_aligned());
                assert_eq!(ptr.0, 1);
            }
            Err(error) => assert_eq!(error, expected_error),
        }

        match SharedPtr::new(PageAligned(2)) {
            Ok(ptr) => {
                assert!(std::ptr::from_ref(ptr.get().unwrap()).is_aligned());
                assert_eq!(ptr.0, 2);
            }
            Err(error) => assert_eq!(
                error,
                Error::InvalidAlignment {
                    alignment: align_of::<ControlBlock<PageAligned>>()
                }
            ),
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn over_aligned_payload_in_aligned_allocator() {
    let allocator = AlignedAllocator::new();

    let unique = UniquePtr::new_in(PageAligned(3), &allocator).unwrap();
    let shared = SharedPtr::new_in(PageAligned(4), &allocator).unwrap();

    assert!(std::ptr::from_ref(unique.get().unwrap()).is_aligned());
    assert!(std::ptr::from_ref(shared.get().unwrap()).is_aligned());
    assert_eq!((unique.0, shared.0), (3, 4));
}

#[test]
#[cfg_attr(miri, ignore)] // Miri cannot execute foreign functions like malloc.
fn trait_object_views_format_through_deref() {
    let values: Vec<SharedPtr<'_, dyn Display>> = vec![
        upcast!(SharedPtr::new(String::from("Alice")).unwrap(), dyn Display),
        upcast!(SharedPtr::new(42_u32).unwrap(), dyn Display),
    ];

    let rendered: Vec<String> = values.iter().map(|value| format!("{}", &**value)).collect();

    assert_eq!(rendered, ["Alice", "42"]);
}

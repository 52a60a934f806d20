#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Injectable allocators and smart pointers that always release memory through the allocator
//! that produced it.
//!
//! The crate is built around the [`Allocator`] trait, a minimal contract that turns a
//! size-and-alignment request into an address and back. Several strategies implement it:
//!
//! * [`Mallocator`] - pass-through to the platform `malloc()` and `free()`.
//! * [`AlignedAllocator`] - platform aligned allocation honoring any power-of-two alignment.
//! * [`PoolAllocator`] - fixed-capacity allocator over a contiguous buffer, either heap-owned
//!   ([`HeapPoolAllocator`]) or embedded in the pool ([`InlinePoolAllocator`]).
//! * [`Reporting`] - a decorator that emits a `tracing` event for every allocation made through
//!   any other allocator.
//!
//! What an allocator does when it cannot satisfy a request is governed by its
//! [`FailurePolicy`]: return null, return an [`Error`], or panic.
//!
//! On top of the allocators sit two smart pointers that borrow an allocator and remember it for
//! the lifetime of the object they own:
//!
//! * [`UniquePtr`] - a single owner, like `Box<T>`.
//! * [`SharedPtr`] - a reference-counted owner, like `Arc<T>`, whose count lives in the same
//!   allocation as the object. Supports checked [downcasts][SharedPtr::downcast].
//!
//! Both can be converted into pointers to trait objects via [`upcast!`]. When no allocator is
//! injected, they use the process-wide [`default_allocator()`].
//!
//! # Examples
//!
//! ```
//! use alloc_kit::{AllocatorExt, HeapPoolAllocator, SharedPtr, UniquePtr};
//!
//! // Typed allocation directly from an allocator.
//! let pool = HeapPoolAllocator::<u32>::new(8);
//!
//! let numbers = pool.allocate::<u32>(4).unwrap().unwrap();
//! assert_eq!(pool.slots_left(), 4);
//!
//! // SAFETY: The pointer came from this pool and holds no values that need dropping.
//! unsafe { pool.deallocate_typed(numbers) };
//!
//! // Smart pointers that place their object in the pool.
//! let boxed = UniquePtr::new_in(42_u32, &pool).unwrap();
//! assert_eq!(*boxed, 42);
//! assert_eq!(pool.slots_left(), 7);
//!
//! // Smart pointers backed by the default allocator.
//! let shared = SharedPtr::new(String::from("hello")).unwrap();
//! let copy = shared.clone();
//! assert_eq!(*copy, "hello");
//! ```
//!
//! # Diagnostics
//!
//! The crate emits events via the `tracing` facade and never installs a subscriber itself:
//!
//! * `trace` - every allocation and deallocation made through a [`Reporting`] allocator,
//!   including the [`default_allocator()`].
//! * `debug` - pool creation.
//! * `error` - fatal failures, emitted right before the corresponding panic.

mod aligned_allocator;
mod allocator;
mod cast;
mod default_allocator;
mod error;
mod failure_policy;
mod mallocator;
mod pool_allocator;
mod reporting;
mod shared_ptr;
mod storage;
mod unique_ptr;

pub use aligned_allocator::*;
pub use allocator::*;
pub use default_allocator::*;
pub use error::Error;
pub(crate) use error::Result;
pub use failure_policy::FailurePolicy;
pub use mallocator::*;
pub use pool_allocator::*;
pub use reporting::*;
pub use shared_ptr::{ControlBlock, SharedPtr};
pub use storage::*;
pub use unique_ptr::UniquePtr;

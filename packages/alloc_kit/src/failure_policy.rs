use std::fmt;

use tracing::error;

use crate::{Error, Result};

/// Determines what an allocator does when it cannot satisfy an allocation request.
///
/// The policy is selected when the allocator is created and applies uniformly to every request
/// made through that allocator instance.
///
/// # Examples
///
/// ```
/// use alloc_kit::{AlignedAllocator, Allocator, FailurePolicy};
///
/// let allocator = AlignedAllocator::builder()
///     .failure_policy(FailurePolicy::ReturnError)
///     .build();
///
/// // 3 is not a valid alignment, so the request fails with an error.
/// assert!(allocator.allocate_raw(4, 3).is_err());
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum FailurePolicy {
    /// A failed request yields `Ok(None)`. The caller must check for it.
    #[default]
    ReturnNull,

    /// A failed request yields an [`Error`] describing why the request failed.
    ReturnError,

    /// A failed request logs a fatal diagnostic and panics.
    ///
    /// Use this where recovery from allocation failure is not meaningful. The panic unwinds
    /// like any other; build with `panic = "abort"` to terminate the process instead.
    Panic,
}

impl FailurePolicy {
    /// Converts an allocation failure into the outcome this policy prescribes.
    pub(crate) fn apply<T>(self, error: Error) -> Result<Option<T>> {
        match self {
            Self::ReturnNull => Ok(None),
            Self::ReturnError => Err(error),
            Self::Panic => fatal(format_args!("{error}")),
        }
    }
}

/// Emits a fatal diagnostic and panics.
///
/// Used for allocation failures under [`FailurePolicy::Panic`] and for caller contract
/// violations that an allocator is able to detect.
#[cold]
#[track_caller]
pub(crate) fn fatal(message: fmt::Arguments<'_>) -> ! {
    error!(reason = %message, "fatal allocator failure");
    panic!("{message}");
}

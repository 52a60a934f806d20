use thiserror::Error;

/// Errors that an allocator can surface when its failure policy is
/// [`FailurePolicy::ReturnError`][crate::FailurePolicy::ReturnError], and that the smart pointer
/// construction functions report when storage for the payload cannot be obtained.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The allocator could not satisfy a request of `size` bytes aligned to `alignment`.
    #[error("out of memory: could not allocate {size} bytes aligned to {alignment}")]
    OutOfMemory {
        /// The number of bytes requested.
        size: usize,

        /// The alignment requested.
        alignment: usize,
    },

    /// The requested alignment is zero or not a power of two.
    #[error("invalid alignment {alignment}: alignment must be a non-zero power of two")]
    InvalidAlignment {
        /// The alignment requested.
        alignment: usize,
    },

    /// A typed allocation of `count` elements of `element_size` bytes does not fit in `usize`.
    #[error("allocation of {count} elements of {element_size} bytes overflows the address space")]
    SizeOverflow {
        /// The number of elements requested.
        count: usize,

        /// The size of a single element, in bytes.
        element_size: usize,
    },
}

/// A specialized `Result` type for allocator operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

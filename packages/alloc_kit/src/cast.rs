/// Converts a [`UniquePtr`][crate::UniquePtr] or [`SharedPtr`][crate::SharedPtr] to a concrete
/// type into one to a trait object (or any other unsized view) that the type coerces to.
///
/// The conversion consumes the pointer and hands its ownership to the new one, so a shared
/// pointer's reference count does not change. To keep the original, upcast a clone:
/// `upcast!(ptr.clone(), dyn Trait)`. An empty pointer converts to an empty pointer.
///
/// The conversion is an implicit coercion, not an `as` cast, so only unsizing conversions
/// compile and the result always refers to the same object. Reinterpreting the object as an
/// unrelated type is rejected:
///
/// ```compile_fail
/// use alloc_kit::{UniquePtr, upcast};
///
/// let number = UniquePtr::new(0x0102_0304_u32).unwrap();
/// let bytes: UniquePtr<[u8; 4]> = upcast!(number, [u8; 4]);
/// ```
///
/// ```compile_fail
/// use alloc_kit::{SharedPtr, upcast};
///
/// let small = SharedPtr::new(7_u8).unwrap();
/// let large: SharedPtr<u64> = upcast!(small, u64);
/// ```
///
/// # Examples
///
/// ```
/// use std::fmt::Display;
///
/// use alloc_kit::{SharedPtr, UniquePtr, upcast};
///
/// let unique = UniquePtr::new(5_u8).unwrap();
/// let unique: UniquePtr<dyn Display> = upcast!(unique, dyn Display);
/// assert_eq!(unique.to_string(), "5");
///
/// let shared = SharedPtr::new(String::from("text")).unwrap();
/// let view: SharedPtr<dyn Display> = upcast!(shared.clone(), dyn Display);
/// assert_eq!(view.to_string(), "text");
/// assert_eq!(shared.reference_count(), 2);
/// ```
#[macro_export]
macro_rules! upcast {
    ($ptr:expr, $target:ty) => {{
        let ptr = $ptr;

        // SAFETY: The closure can only perform a coercion, and an unsizing coercion keeps the
        // address while attaching metadata.
        unsafe { ptr.__private_cast_dyn_with_fn(|raw| -> *mut $target { raw }) }
    }};
}

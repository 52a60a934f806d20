//! Basic usage of the `alloc_kit` crate:
//!
//! * Creating a pool allocator.
//! * Placing objects in it via smart pointers.
//! * Viewing shared objects as trait objects and back.
//! * Observing what happens when the pool runs out of room.

use std::fmt::Display;

use alloc_kit::{
    ControlBlock, FailurePolicy, HeapPoolAllocator, SharedPtr, UniquePtr, upcast,
};

fn main() {
    // A pool holds a fixed number of elements of one type. Smart pointers that use it must
    // fit that element size, which for shared pointers includes the reference count.
    let strings = HeapPoolAllocator::<ControlBlock<String>>::builder()
        .capacity(2)
        .failure_policy(FailurePolicy::ReturnNull)
        .build();

    let alice = SharedPtr::new_in("Alice".to_string(), &strings).unwrap();
    let bob = SharedPtr::new_in("Bob".to_string(), &strings).unwrap();

    println!(
        "Pool holds {} of {} objects",
        strings.capacity() - strings.slots_left(),
        strings.capacity()
    );

    // The pool is full, so under the ReturnNull policy we get an empty pointer back.
    let charlie = SharedPtr::new_in("Charlie".to_string(), &strings).unwrap();
    println!("Charlie was placed: {}", !charlie.is_empty());

    // Any shared pointer can be viewed as a trait object that its type implements.
    let names: Vec<SharedPtr<'_, dyn Display, _>> =
        vec![upcast!(alice.clone(), dyn Display), upcast!(bob, dyn Display)];

    for name in &names {
        println!("Name: {} (references: {})", &**name, name.reference_count());
    }

    // The concrete type is remembered, so we can get back to it.
    let alice_again = names[0].downcast::<String>();
    println!("Alice has {} characters", alice_again.len());

    drop(names);
    drop(alice_again);
    drop(alice);
    println!("Pool is empty again: {}", strings.is_empty());

    // Unique pointers work with any allocator, including the default one.
    let mut greeting = UniquePtr::new(String::from("Hello")).unwrap();
    greeting.push_str(", world");
    println!("{}", *greeting);
}

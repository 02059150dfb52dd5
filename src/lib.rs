#![no_std]

//! Relocatable pointers and allocator-aware containers.
//!
//! The building blocks, bottom-up:
//!
//! - [`OffsetPtr`](offset_ptr/struct.OffsetPtr.html): a pointer that stores
//!   the distance to its target rather than the target's address, so a block
//!   of memory full of them can be copied to a new base and still make sense.
//! - [`Allocator`](allocators/trait.Allocator.html): what a container needs
//!   from an allocator, including whether the allocator follows the contents on
//!   copy and move assignment.
//! - [`Arena`](arena/struct.Arena.html): a bump allocator over a single block,
//!   which can be relocated wholesale.
//! - [`VlArray`](vlarray/struct.VlArray.html): a fixed-length array built
//!   through an `Allocator`, with all-or-nothing construction and assignment.
//!
//! The crate is `no_std` and needs `alloc`. With the `use_libc` feature, arenas
//! are backed by anonymous `mmap` pages instead of the global heap.

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod arena;
pub mod error;
pub mod offset_ptr;
pub mod vlarray;

pub use allocators::{Allocator, ArenaAlloc, CopySelection, Global, OffsetAlloc, PointerLike, Propagation};
pub use arena::Arena;
pub use error::{AllocError, Error};
pub use offset_ptr::{OffsetConstPtr, OffsetPtr, OpaqueConstPtr, OpaquePtr};
pub use vlarray::VlArray;

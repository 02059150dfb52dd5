//! Allocator capabilities, and the allocators shipped with this crate.
//!
//! ## Traits
//!
//! ### [`Allocator`](trait.Allocator.html)
//!
//! The capability set a container needs from its allocator: allocate and
//! deallocate arrays of `T`, compare two allocators for interchangeability,
//! and a compile-time [`Propagation`](struct.Propagation.html) policy telling
//! the container whether the allocator follows its contents on copy and move
//! assignment, and how a copied container picks its allocator.
//!
//! ### [`PointerLike`](trait.PointerLike.html)
//!
//! The handle type a container records its storage in. Allocators pick it:
//! a native `*mut T`, or a relocatable [`OffsetPtr`](../offset_ptr/struct.OffsetPtr.html).
//!
//! ## Allocators
//!
//! ### [`Global`](struct.Global.html)
//!
//! The heap, through `alloc::alloc`, with native pointers. Stateless; every
//! instance is interchangeable.
//!
//! ### [`OffsetAlloc`](struct.OffsetAlloc.html)
//!
//! Also the heap, but containers record their storage as `OffsetPtr`s. It does
//! nothing useful beyond giving `OffsetPtr` a real allocator to live in.
//!
//! ### [`ArenaAlloc`](struct.ArenaAlloc.html)
//!
//! A shared handle to a bump [`Arena`](../arena/struct.Arena.html). Storage
//! is recorded as `OffsetPtr`s, so the elements a container keeps in the arena
//! are copied intact by [`Arena::relocated`](../arena/struct.Arena.html#method.relocated).
//! The handle itself is an `Rc`, an absolute pointer living outside the arena:
//! a container using it stays tied to the original arena, and only raw data
//! linked by `OffsetPtr`s inside the block is fully relocatable.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::rc::Rc;
use core::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::error::AllocError;
use crate::offset_ptr::OffsetPtr;

/// A nullable handle to the first element of a container's storage.
///
/// # Safety
///
/// `address` must return exactly the last pointer passed to `point_to` (null
/// for a handle made by `null`), for as long as the handle has not moved since
/// then. Implementations that are `Unpin` must keep returning it after being
/// moved by value; containers rely on that to hand such handles around freely.
pub unsafe trait PointerLike<T> {
    /// A handle pointing nowhere.
    fn null() -> Self;

    fn address(&self) -> *mut T;

    /// Re-point the handle, relative to wherever it lives right now.
    fn point_to(&mut self, target: *mut T);

    fn is_null(&self) -> bool {
        self.address().is_null()
    }
}

unsafe impl<T> PointerLike<T> for *mut T {
    fn null() -> Self {
        ptr::null_mut()
    }

    fn address(&self) -> *mut T {
        *self
    }

    fn point_to(&mut self, target: *mut T) {
        *self = target;
    }
}

/// How a copied container chooses its allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySelection {
    /// The copy gets a clone of the source's allocator, sharing its state.
    Share,
    /// The copy gets [`Allocator::duplicate`], with state of its own.
    Duplicate,
}

/// Whether an allocator travels with the contents of its container.
///
/// Read once at the top of each affected container operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Propagation {
    /// Copy assignment also replaces the target's allocator with the source's.
    pub on_copy_assign: bool,
    /// Move assignment also replaces the target's allocator with the
    /// source's, which makes it an unconditional buffer hand-over.
    pub on_move_assign: bool,
    pub select_on_copy: CopySelection,
}

impl Propagation {
    /// Never propagate; copies share the source allocator's state.
    pub const NONE: Propagation = Propagation {
        on_copy_assign: false,
        on_move_assign: false,
        select_on_copy: CopySelection::Share,
    };
}

/// A source of storage for containers.
///
/// Two allocators compare equal when memory from one may be released through
/// the other.
///
/// # Safety
///
/// A successful `allocate::<T>(count)` must return memory valid for reads and
/// writes of `count` values of `T`, suitably aligned, that stays valid until it
/// is passed to `deallocate` with the same `count` on this allocator or one
/// equal to it. Requests of zero bytes must succeed with a dangling pointer.
pub unsafe trait Allocator: Clone + PartialEq {
    /// The handle a container records its storage in.
    type Pointer<T>: PointerLike<T>;

    const PROPAGATION: Propagation = Propagation::NONE;

    fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate::<T>(count)` on this allocator (or an equal
    /// one), and not have been deallocated since.
    unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize);

    /// An allocator with state of its own, for [`CopySelection::Duplicate`].
    fn duplicate(&self) -> Result<Self, AllocError> {
        Ok(self.clone())
    }

    /// The allocator a copy of a container using `self` should use.
    fn select_on_copy(&self) -> Result<Self, AllocError> {
        match Self::PROPAGATION.select_on_copy {
            CopySelection::Share => Ok(self.clone()),
            CopySelection::Duplicate => self.duplicate(),
        }
    }
}

fn array_layout<T>(count: usize) -> Result<Layout, AllocError> {
    Layout::array::<T>(count).map_err(|_| AllocError::CapacityOverflow)
}

fn heap_allocate<T>(count: usize) -> Result<NonNull<T>, AllocError> {
    let layout = array_layout::<T>(count)?;
    if layout.size() == 0 {
        return Ok(NonNull::dangling());
    }

    let ptr = unsafe { alloc(layout) } as *mut T;
    NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
        size: layout.size(),
        align: layout.align(),
    })
}

// Inverse of heap_allocate; the layout was already validated there.
unsafe fn heap_deallocate<T>(ptr: NonNull<T>, count: usize) {
    let size = core::mem::size_of::<T>() * count;
    if size == 0 {
        return;
    }
    let layout = Layout::from_size_align_unchecked(size, core::mem::align_of::<T>());
    dealloc(ptr.as_ptr() as *mut u8, layout);
}

/// The heap, handing out native pointers.
///
/// Move assignment always hands buffers over, since any instance can free
/// memory from any other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Global;

unsafe impl Allocator for Global {
    type Pointer<T> = *mut T;

    const PROPAGATION: Propagation = Propagation {
        on_copy_assign: false,
        on_move_assign: true,
        select_on_copy: CopySelection::Share,
    };

    fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        heap_allocate(count)
    }

    unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        heap_deallocate(ptr, count)
    }
}

/// The heap, with storage recorded as [`OffsetPtr`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffsetAlloc;

unsafe impl Allocator for OffsetAlloc {
    type Pointer<T> = OffsetPtr<T>;

    fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        heap_allocate(count)
    }

    unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        heap_deallocate(ptr, count)
    }
}

/// A shared handle to a bump [`Arena`].
///
/// Clones share the arena; two handles are equal when they share it. A copied
/// container gets a fresh arena of the same capacity rather than a share of
/// the source's.
///
/// The handle is not relocatable. After [`Arena::relocated`] a container still
/// allocates from, and reads its elements in, the original arena; the copy of
/// its elements has to be found with [`Arena::translate`]. Types aligned above
/// [`BLOCK_ALIGN`](../arena/constant.BLOCK_ALIGN.html) are refused with
/// [`AllocError::UnsupportedAlignment`].
#[derive(Clone, Debug)]
pub struct ArenaAlloc {
    arena: Rc<Arena>,
}

impl ArenaAlloc {
    /// A handle to a new arena of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        Ok(ArenaAlloc::from(Arena::new(capacity)?))
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl From<Arena> for ArenaAlloc {
    fn from(arena: Arena) -> Self {
        ArenaAlloc {
            arena: Rc::new(arena),
        }
    }
}

impl PartialEq for ArenaAlloc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.arena, &other.arena)
    }
}

impl Eq for ArenaAlloc {}

unsafe impl Allocator for ArenaAlloc {
    type Pointer<T> = OffsetPtr<T>;

    const PROPAGATION: Propagation = Propagation {
        on_copy_assign: false,
        on_move_assign: false,
        select_on_copy: CopySelection::Duplicate,
    };

    fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let layout = array_layout::<T>(count)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        self.arena.allocate(layout).map(NonNull::cast)
    }

    unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        let size = core::mem::size_of::<T>() * count;
        if size == 0 {
            return;
        }
        self.arena.deallocate(ptr.cast(), size);
    }

    fn duplicate(&self) -> Result<Self, AllocError> {
        ArenaAlloc::new(self.arena.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_zero_sized_requests_never_allocate() {
        let ptr = Global.allocate::<()>(16).unwrap();
        assert_eq!(ptr, NonNull::dangling());
        let ptr = Global.allocate::<u64>(0).unwrap();
        assert_eq!(ptr, NonNull::dangling());
        unsafe { Global.deallocate(ptr, 0) };

        let arena = ArenaAlloc::new(64).unwrap();
        arena.allocate::<u32>(0).unwrap();
        assert_eq!(arena.arena().used(), 0);
    }

    #[test]
    fn test_oversized_requests_overflow() {
        assert_eq!(
            Global.allocate::<u64>(usize::MAX),
            Err(AllocError::CapacityOverflow)
        );
    }

    #[test]
    fn test_heap_round_trip() {
        let ptr = OffsetAlloc.allocate::<u64>(4).unwrap();
        assert_eq!(ptr.as_ptr() as usize % core::mem::align_of::<u64>(), 0);
        unsafe {
            for i in 0..4 {
                ptr.as_ptr().add(i).write(i as u64);
            }
            assert_eq!(*ptr.as_ptr().add(3), 3);
            OffsetAlloc.deallocate(ptr, 4);
        }
    }

    #[test]
    fn test_arena_handles_compare_by_identity() {
        let first = ArenaAlloc::new(128).unwrap();
        let shared = first.clone();
        let other = ArenaAlloc::new(128).unwrap();
        assert_eq!(first, shared);
        assert_ne!(first, other);

        let copy = first.select_on_copy().unwrap();
        assert_ne!(copy, first);
        assert_eq!(copy.arena().capacity(), first.arena().capacity());
        assert_eq!(Global.select_on_copy().unwrap(), Global);
    }

    #[test]
    fn test_arena_exhaustion_is_reported() {
        let arena = ArenaAlloc::new(64).unwrap();
        let capacity = arena.arena().capacity();
        arena.allocate::<u8>(capacity - 8).unwrap();
        match arena.allocate::<u64>(2) {
            Err(AllocError::ArenaExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 16);
                assert_eq!(available, 8);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
}

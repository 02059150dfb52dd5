//! Self-relative ("offset") pointers.
//!
//! An [`OffsetPtr`] stores the distance from its own address to its target
//! instead of the target's address. A block of memory holding such pointers
//! together with their targets can be copied byte-for-byte to another base
//! address, or mapped somewhere else, and every pointer inside the copy still
//! resolves to the corresponding target inside the copy: both ends of the
//! relation move by the same amount, so `target - self` is unchanged.
//!
//! The flip side is that a pointer which moves *without* its target silently
//! re-targets. Rust moves values by plain bitwise copy, so these types are
//! neither `Clone` nor `Copy`, are `!Unpin`, and are never handed out by value
//! except as null. They are written in place with [`OffsetPtr::set`],
//! [`OffsetPtr::assign`] and friends (which recompute the displacement from the
//! pointer's current address), or with [`OffsetPtr::write`] into raw memory.
//! Operations that would produce a fresh pointer value (`&p + n`, `&p - n`,
//! [`OffsetPtr::post_increment`]) return the resolved native pointer instead.
//!
//! ```text
//!   S                       S + d
//!   ┌─────────┐             ┌────────┐
//!   │ d       │ ──────────▶ │ target │      copied verbatim to S':
//!   └─────────┘             └────────┘
//!   S'                      S' + d
//!   ┌─────────┐             ┌────────┐
//!   │ d       │ ──────────▶ │ target'│
//!   └─────────┘             └────────┘
//! ```

use core::cmp::Ordering;
use core::ffi::c_void;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::{PhantomData, PhantomPinned};
use core::mem;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use core::ptr::{self, NonNull};
use core::slice;

use static_assertions::{assert_impl_all, assert_not_impl_any, const_assert_eq};

use crate::allocators::PointerLike;

/// The displacement reserved for "points nowhere".
///
/// A real displacement equal to this value would mean a target exactly one
/// byte before the pointer itself. That is a hard limit of the encoding: every
/// store checks for it and panics instead of quietly producing a null pointer.
pub const NULL_DISPLACEMENT: usize = usize::MAX;

macro_rules! offset_pointer {
    ($(#[$meta:meta])* $name:ident, $raw:ty) => {
        $(#[$meta])*
        #[repr(transparent)]
        pub struct $name<T> {
            offset: usize,
            _target: PhantomData<$raw>,
            _pinned: PhantomPinned,
        }

        impl<T> $name<T> {
            /// A pointer to nothing. This is the only value that is safe to
            /// move around on its own.
            pub const fn null() -> Self {
                $name {
                    offset: NULL_DISPLACEMENT,
                    _target: PhantomData,
                    _pinned: PhantomPinned,
                }
            }

            /// Initialise the pointer living at `slot` so that it refers to
            /// `target`.
            ///
            /// # Safety
            ///
            /// `slot` must be valid for writes and aligned for `Self`. Whatever
            /// was there before is overwritten without being dropped.
            pub unsafe fn write(slot: *mut Self, target: $raw) {
                slot.write(Self::null());
                (*slot).set(target);
            }

            #[inline]
            fn anchor(&self) -> usize {
                self as *const Self as usize
            }

            #[inline]
            pub fn is_null(&self) -> bool {
                self.offset == NULL_DISPLACEMENT
            }

            /// The stored distance from this pointer to its target, in bytes,
            /// modulo the address space. `None` when null.
            pub fn displacement(&self) -> Option<usize> {
                if self.is_null() {
                    None
                } else {
                    Some(self.offset)
                }
            }

            /// The target's address, computed from where this pointer lives now.
            #[inline]
            pub fn resolve(&self) -> $raw {
                if self.is_null() {
                    ptr::null::<T>() as $raw
                } else {
                    self.anchor().wrapping_add(self.offset) as $raw
                }
            }

            /// Point at `target`, relative to this pointer's current address.
            pub fn set(&mut self, target: $raw) {
                self.offset = if target.is_null() {
                    NULL_DISPLACEMENT
                } else {
                    let offset = (target as usize).wrapping_sub(self.anchor());
                    assert!(
                        offset != NULL_DISPLACEMENT,
                        "displacement to {:p} collides with the null sentinel",
                        target
                    );
                    offset
                };
            }

            pub fn set_null(&mut self) {
                self.offset = NULL_DISPLACEMENT;
            }

            /// Point at whatever `src` points at. The displacement is
            /// recomputed for this pointer's own address, never copied.
            pub fn assign(&mut self, src: &Self) {
                self.set(src.resolve());
            }

            /// Point at `src`'s target, reinterpreted as a `T`. This covers the
            /// conversions to and from the opaque pointer types.
            pub fn cast_assign<U>(&mut self, src: &$name<U>) {
                self.set(src.resolve() as $raw);
            }

            #[inline]
            fn shifted(&self, count: isize) -> $raw {
                debug_assert!(!self.is_null(), "arithmetic on a null offset pointer");
                self.resolve().wrapping_offset(count)
            }

            /// Pre-increment: advance by one element and return `self`.
            pub fn increment(&mut self) -> &mut Self {
                *self += 1;
                self
            }

            /// Pre-decrement: step back one element and return `self`.
            pub fn decrement(&mut self) -> &mut Self {
                *self -= 1;
                self
            }

            /// Post-increment: advance by one element, returning the previous
            /// target.
            pub fn post_increment(&mut self) -> $raw {
                let previous = self.resolve();
                *self += 1;
                previous
            }

            /// Post-decrement: step back one element, returning the previous
            /// target.
            pub fn post_decrement(&mut self) -> $raw {
                let previous = self.resolve();
                *self -= 1;
                previous
            }

            /// # Safety
            ///
            /// The pointer must be non-null and its target valid for reads for
            /// `'a`.
            pub unsafe fn as_ref<'a>(&self) -> &'a T {
                debug_assert!(!self.is_null(), "dereferenced a null offset pointer");
                &*self.resolve()
            }

            /// # Safety
            ///
            /// The pointer must be non-null and `index` elements past the
            /// target must be valid for reads for `'a`.
            pub unsafe fn get_unchecked<'a>(&self, index: usize) -> &'a T {
                debug_assert!(!self.is_null(), "indexed a null offset pointer");
                &*self.resolve().add(index)
            }

            /// View `len` elements starting at the target.
            ///
            /// # Safety
            ///
            /// Same as [`slice::from_raw_parts`] for the resolved pointer.
            pub unsafe fn as_slice<'a>(&self, len: usize) -> &'a [T] {
                debug_assert!(!self.is_null(), "sliced a null offset pointer");
                slice::from_raw_parts(self.resolve(), len)
            }
        }

        impl<T> Default for $name<T> {
            fn default() -> Self {
                Self::null()
            }
        }

        impl<T> AddAssign<isize> for $name<T> {
            fn add_assign(&mut self, count: isize) {
                let target = self.shifted(count);
                self.set(target);
            }
        }

        impl<T> SubAssign<isize> for $name<T> {
            fn sub_assign(&mut self, count: isize) {
                let target = self.shifted(count.wrapping_neg());
                self.set(target);
            }
        }

        impl<'a, T> Add<isize> for &'a $name<T> {
            type Output = $raw;

            fn add(self, count: isize) -> $raw {
                self.shifted(count)
            }
        }

        impl<'a, T> Sub<isize> for &'a $name<T> {
            type Output = $raw;

            fn sub(self, count: isize) -> $raw {
                self.shifted(count.wrapping_neg())
            }
        }

        /// Signed distance between the two targets, in elements.
        impl<'a, 'b, T> Sub<&'b $name<T>> for &'a $name<T> {
            type Output = isize;

            fn sub(self, rhs: &'b $name<T>) -> isize {
                let bytes = (self.resolve() as isize).wrapping_sub(rhs.resolve() as isize);
                match mem::size_of::<T>() {
                    0 => 0,
                    size => bytes / size as isize,
                }
            }
        }

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.resolve() == other.resolve()
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> PartialOrd for $name<T> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl<T> Ord for $name<T> {
            fn cmp(&self, other: &Self) -> Ordering {
                self.resolve().cmp(&other.resolve())
            }
        }

        impl<T> Hash for $name<T> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.resolve().hash(state)
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, "{}(null)", stringify!($name))
                } else {
                    f.debug_tuple(stringify!($name))
                        .field(&self.resolve())
                        .finish()
                }
            }
        }

        impl<T> fmt::Pointer for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Pointer::fmt(&self.resolve(), f)
            }
        }
    };
}

offset_pointer! {
    /// A self-relative pointer to a mutable `T`.
    OffsetPtr, *mut T
}

offset_pointer! {
    /// A self-relative pointer to a read-only `T`.
    OffsetConstPtr, *const T
}

/// An untyped offset pointer.
pub type OpaquePtr = OffsetPtr<c_void>;

/// An untyped, read-only offset pointer.
pub type OpaqueConstPtr = OffsetConstPtr<c_void>;

impl<T> OffsetPtr<T> {
    pub fn pointer_to(&mut self, target: &mut T) {
        self.set(target);
    }

    pub fn as_non_null(&self) -> Option<NonNull<T>> {
        NonNull::new(self.resolve())
    }

    /// # Safety
    ///
    /// The pointer must be non-null, its target valid for writes for `'a`, and
    /// not aliased for that long.
    pub unsafe fn as_mut<'a>(&self) -> &'a mut T {
        debug_assert!(!self.is_null(), "dereferenced a null offset pointer");
        &mut *self.resolve()
    }

    /// # Safety
    ///
    /// As [`OffsetPtr::as_mut`], for the element `index` places past the
    /// target.
    pub unsafe fn get_unchecked_mut<'a>(&self, index: usize) -> &'a mut T {
        debug_assert!(!self.is_null(), "indexed a null offset pointer");
        &mut *self.resolve().add(index)
    }

    /// # Safety
    ///
    /// Same as [`slice::from_raw_parts_mut`] for the resolved pointer.
    pub unsafe fn as_mut_slice<'a>(&self, len: usize) -> &'a mut [T] {
        debug_assert!(!self.is_null(), "sliced a null offset pointer");
        slice::from_raw_parts_mut(self.resolve(), len)
    }
}

impl<T> OffsetConstPtr<T> {
    pub fn pointer_to(&mut self, target: &T) {
        self.set(target);
    }

    /// Point at `src`'s target, read-only.
    pub fn assign_from_mut(&mut self, src: &OffsetPtr<T>) {
        self.set(src.resolve());
    }
}

unsafe impl<T> PointerLike<T> for OffsetPtr<T> {
    fn null() -> Self {
        OffsetPtr::null()
    }

    fn address(&self) -> *mut T {
        self.resolve()
    }

    fn point_to(&mut self, target: *mut T) {
        self.set(target);
    }
}

const_assert_eq!(mem::size_of::<OffsetPtr<u64>>(), mem::size_of::<usize>());
const_assert_eq!(mem::size_of::<OffsetConstPtr<u8>>(), mem::size_of::<usize>());
assert_not_impl_any!(OffsetPtr<u8>: Clone, Copy, Unpin, Send, Sync);
assert_not_impl_any!(OffsetConstPtr<u8>: Clone, Copy, Unpin);
assert_impl_all!(OffsetPtr<u8>: Default, Eq, Ord, Hash);

//! An allocator-aware array whose length is fixed once it is built.
//!
//! A [`VlArray`] owns exactly `len()` initialised elements in one block from
//! its allocator, or owns nothing at all. It never grows or shrinks in place:
//! every operation that changes the contents builds a complete new block first
//! and only then gives up the old one, so a failure part-way through leaves the
//! array as it was.
//!
//! The allocator decides how the array records its block (see
//! [`Allocator::Pointer`](../allocators/trait.Allocator.html#associatedtype.Pointer)).
//! With a self-relative handle such as [`OffsetPtr`](../offset_ptr/struct.OffsetPtr.html)
//! the array must not move while it owns storage, so every mutating operation
//! takes `self: Pin<&mut Self>`, and the by-value constructors only exist for
//! allocators whose handle is `Unpin`. For those, `Pin::new(&mut array)` is all
//! it takes to call a mutator.

use alloc::boxed::Box;
use core::convert::Infallible;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::slice;

use log::debug;

use crate::allocators::{Allocator, Global, PointerLike};
use crate::error::{AllocError, Error};

/// Elements built so far into a fresh block. Dropping this destroys them in
/// reverse order and releases the block.
struct Staging<'a, T, A: Allocator> {
    alloc: &'a A,
    ptr: NonNull<T>,
    count: usize,
    built: usize,
}

impl<'a, T, A: Allocator> Drop for Staging<'a, T, A> {
    fn drop(&mut self) {
        if self.built < self.count {
            debug!(
                "rolling back {} of {} elements at {:p}",
                self.built, self.count, self.ptr
            );
        }

        // Finishes dropping and releases the block, also when an element's
        // destructor unwinds out of the first pass.
        struct Resume<'s, 'a, T, A: Allocator>(&'s mut Staging<'a, T, A>);

        impl<'s, 'a, T, A: Allocator> Drop for Resume<'s, 'a, T, A> {
            fn drop(&mut self) {
                self.0.unwind();
                unsafe { self.0.alloc.deallocate(self.0.ptr, self.0.count) };
            }
        }

        let mut resume = Resume(self);
        resume.0.unwind();
    }
}

impl<'a, T, A: Allocator> Staging<'a, T, A> {
    // Drop the built elements, last first. An element whose destructor panics
    // is already off the count.
    fn unwind(&mut self) {
        while self.built > 0 {
            self.built -= 1;
            unsafe { ptr::drop_in_place(self.ptr.as_ptr().add(self.built)) };
        }
    }
}

/// Allocate `count` elements and build each with `make(index)`, in order.
/// Nothing is allocated for `count == 0`.
fn construct<T, A, E, F>(alloc: &A, count: usize, mut make: F) -> Result<Option<NonNull<T>>, Error<E>>
where
    A: Allocator,
    F: FnMut(usize) -> Result<T, E>,
{
    if count == 0 {
        return Ok(None);
    }

    let ptr = alloc.allocate::<T>(count)?;
    let mut staging = Staging {
        alloc,
        ptr,
        count,
        built: 0,
    };
    while staging.built < count {
        let value = make(staging.built).map_err(Error::Construct)?;
        unsafe { ptr.as_ptr().add(staging.built).write(value) };
        staging.built += 1;
    }

    mem::forget(staging);
    Ok(Some(ptr))
}

fn clone_slice<T: Clone, A: Allocator>(
    alloc: &A,
    source: &[T],
) -> Result<Option<NonNull<T>>, AllocError> {
    construct(alloc, source.len(), |i| Ok::<T, Infallible>(source[i].clone()))
        .map_err(Error::into_alloc)
}

/// A contiguous array of `T`, sized once at construction, stored through the
/// allocator `A`.
///
/// # Examples
///
/// ```
/// use offset_allocator::VlArray;
///
/// let array: VlArray<u32> = VlArray::from_elem(3, 7).unwrap();
/// let copy = array.clone();
/// assert_eq!(copy.as_slice(), &[7, 7, 7]);
/// ```
pub struct VlArray<T, A: Allocator = Global> {
    data: A::Pointer<T>,
    len: usize,
    alloc: A,
    _owns: PhantomData<T>,
}

// Elements live behind the handle, never inline, so only the handle decides
// whether the array may move.
impl<T, A: Allocator> Unpin for VlArray<T, A> where A::Pointer<T>: Unpin {}

impl<T> VlArray<T> {
    /// An empty array on the global heap.
    pub const fn new() -> Self {
        VlArray {
            data: ptr::null_mut(),
            len: 0,
            alloc: Global,
            _owns: PhantomData,
        }
    }
}

impl<T, A: Allocator> VlArray<T, A> {
    /// An empty array. Empty arrays own nothing, so they may be moved freely
    /// whatever handle the allocator uses.
    pub fn new_in(alloc: A) -> Self {
        VlArray {
            data: <A::Pointer<T> as PointerLike<T>>::null(),
            len: 0,
            alloc,
            _owns: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The first element, or null for an empty array.
    pub fn as_ptr(&self) -> *const T {
        self.data.address()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.data.address()
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.data.address(), self.len) }
    }

    pub fn as_mut_slice<'a>(self: Pin<&'a mut Self>) -> &'a mut [T] {
        unsafe { self.get_unchecked_mut() }.slice_mut()
    }

    fn slice_mut(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.data.address(), self.len) }
    }

    // Record `storage` as this (empty) array's block.
    fn install(&mut self, storage: Option<NonNull<T>>, len: usize) {
        debug_assert!(self.data.is_null(), "installing over a live block");
        match storage {
            Some(ptr) => {
                self.data.point_to(ptr.as_ptr());
                self.len = len;
            }
            None => {
                self.data.point_to(ptr::null_mut());
                self.len = 0;
            }
        }
    }

    // Drop every element, last first, and hand the block back. The array is
    // already empty by the time the first element drops.
    fn release(&mut self) {
        let len = mem::replace(&mut self.len, 0);
        let ptr = self.data.address();
        self.data.point_to(ptr::null_mut());
        if let Some(ptr) = NonNull::new(ptr) {
            drop(Staging {
                alloc: &self.alloc,
                ptr,
                count: len,
                built: len,
            });
        }
    }

    // Take over `source`'s block, leaving it empty. `self` must be empty.
    fn adopt(&mut self, source: &mut Self) {
        let len = mem::replace(&mut source.len, 0);
        let ptr = source.data.address();
        source.data.point_to(ptr::null_mut());
        self.install(NonNull::new(ptr), len);
    }

    /// Replace the contents with `count` elements built by `f(index)`.
    ///
    /// If `f` fails, or the allocation does, the elements built so far are
    /// dropped in reverse order, the new block is released, and the array
    /// keeps its previous contents.
    pub fn try_fill_with<E, F>(self: Pin<&mut Self>, count: usize, f: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize) -> Result<T, E>,
    {
        let this = unsafe { self.get_unchecked_mut() };
        let storage = construct(&this.alloc, count, f)?;
        this.release();
        this.install(storage, count);
        Ok(())
    }

    /// Replace the contents with `count` clones of `value`.
    pub fn fill(self: Pin<&mut Self>, count: usize, value: T) -> Result<(), AllocError>
    where
        T: Clone,
    {
        self.try_fill_with(count, |_| Ok::<T, Infallible>(value.clone()))
            .map_err(Error::into_alloc)
    }

    /// Copy assignment.
    ///
    /// When the allocator propagates on copy assignment the new block comes
    /// from `source`'s allocator, which then replaces this one; otherwise this
    /// array's allocator is kept. Either way the copy is complete before the
    /// old contents are dropped, so on failure nothing has changed.
    pub fn assign_clone(self: Pin<&mut Self>, source: &Self) -> Result<(), AllocError>
    where
        T: Clone,
    {
        let this = unsafe { self.get_unchecked_mut() };
        let propagate = A::PROPAGATION.on_copy_assign;

        let alloc = if propagate { &source.alloc } else { &this.alloc };
        let storage = clone_slice(alloc, source.as_slice())?;

        this.release();
        if propagate {
            this.alloc = source.alloc.clone();
        }
        this.install(storage, source.len);
        Ok(())
    }

    /// Move assignment by handing the block over, with no bound on `T`.
    ///
    /// When the allocator propagates on move assignment, or the two allocators
    /// are equal, this array drops its contents and takes over `source`'s
    /// block, leaving `source` empty, and `true` is returned. Otherwise the
    /// block cannot change hands; both arrays are left alone and the result is
    /// `false`. Allocators whose instances always compare equal, such as
    /// [`OffsetAlloc`](../allocators/struct.OffsetAlloc.html), always succeed.
    pub fn assign_adopt(self: Pin<&mut Self>, source: Pin<&mut Self>) -> bool {
        let this = unsafe { self.get_unchecked_mut() };
        let source = unsafe { source.get_unchecked_mut() };
        let propagate = A::PROPAGATION.on_move_assign;

        if !propagate && this.alloc != source.alloc {
            return false;
        }

        this.release();
        if propagate {
            this.alloc = source.alloc.clone();
        }
        this.adopt(source);
        true
    }

    /// Move assignment.
    ///
    /// Hands the block over as [`VlArray::assign_adopt`] does whenever it can,
    /// which cannot fail. Otherwise `source`'s elements are cloned into fresh
    /// storage from this array's allocator and `source` is left untouched.
    /// Move-only elements go through `assign_adopt` instead.
    pub fn assign_take(
        mut self: Pin<&mut Self>,
        mut source: Pin<&mut Self>,
    ) -> Result<(), AllocError>
    where
        T: Clone,
    {
        if self.as_mut().assign_adopt(source.as_mut()) {
            return Ok(());
        }

        let this = unsafe { self.get_unchecked_mut() };
        let storage = clone_slice(&this.alloc, source.as_slice())?;
        this.release();
        this.install(storage, source.len);
        Ok(())
    }

    /// Drop every element, last first, and release the storage.
    pub fn clear(self: Pin<&mut Self>) {
        unsafe { self.get_unchecked_mut() }.release();
    }

    /// Exchange contents and allocators. No element is touched.
    pub fn swap(self: Pin<&mut Self>, other: Pin<&mut Self>) {
        let this = unsafe { self.get_unchecked_mut() };
        let other = unsafe { other.get_unchecked_mut() };

        let mine = this.data.address();
        let theirs = other.data.address();
        this.data.point_to(theirs);
        other.data.point_to(mine);
        mem::swap(&mut this.len, &mut other.len);
        mem::swap(&mut this.alloc, &mut other.alloc);
    }

    /// A copy of this array in its own pinned box, with the allocator picked
    /// by [`Allocator::select_on_copy`]. Works for every allocator, unlike
    /// [`VlArray::try_clone`].
    pub fn try_clone_pinned(&self) -> Result<Pin<Box<Self>>, AllocError>
    where
        T: Clone,
    {
        let alloc = self.alloc.select_on_copy()?;
        let storage = clone_slice(&alloc, self.as_slice())?;

        let mut copy = Box::pin(VlArray::new_in(alloc));
        unsafe { copy.as_mut().get_unchecked_mut() }.install(storage, self.len);
        Ok(copy)
    }
}

/// By-value construction, for allocators whose handle survives being moved.
impl<T, A: Allocator> VlArray<T, A>
where
    A::Pointer<T>: Unpin,
{
    fn from_storage(storage: Option<NonNull<T>>, len: usize, alloc: A) -> Self {
        let mut array = VlArray::new_in(alloc);
        array.install(storage, len);
        array
    }

    /// An array of `count` elements built by `f(index)`, in index order.
    ///
    /// On failure every element already built is dropped, last first, and the
    /// storage is released before the error is returned.
    pub fn try_from_fn_in<E, F>(count: usize, f: F, alloc: A) -> Result<Self, Error<E>>
    where
        F: FnMut(usize) -> Result<T, E>,
    {
        let storage = construct(&alloc, count, f)?;
        Ok(Self::from_storage(storage, count, alloc))
    }

    pub fn from_elem_in(count: usize, value: T, alloc: A) -> Result<Self, AllocError>
    where
        T: Clone,
    {
        Self::try_from_fn_in(count, |_| Ok::<T, Infallible>(value.clone()), alloc)
            .map_err(Error::into_alloc)
    }

    /// An array of `count` default elements.
    pub fn with_len_in(count: usize, alloc: A) -> Result<Self, AllocError>
    where
        T: Default,
    {
        Self::try_from_fn_in(count, |_| Ok::<T, Infallible>(T::default()), alloc)
            .map_err(Error::into_alloc)
    }

    pub fn from_elem(count: usize, value: T) -> Result<Self, AllocError>
    where
        T: Clone,
        A: Default,
    {
        Self::from_elem_in(count, value, A::default())
    }

    pub fn with_len(count: usize) -> Result<Self, AllocError>
    where
        T: Default,
        A: Default,
    {
        Self::with_len_in(count, A::default())
    }

    /// A copy of this array using `alloc`.
    pub fn clone_in(&self, alloc: A) -> Result<Self, AllocError>
    where
        T: Clone,
    {
        let storage = clone_slice(&alloc, self.as_slice())?;
        Ok(Self::from_storage(storage, self.len, alloc))
    }

    /// A copy of this array, with the allocator picked by
    /// [`Allocator::select_on_copy`].
    pub fn try_clone(&self) -> Result<Self, AllocError>
    where
        T: Clone,
    {
        self.clone_in(self.alloc.select_on_copy()?)
    }

    /// Move construction: a new array owning this one's block, which is left
    /// empty. Nothing is allocated or copied.
    pub fn take(&mut self) -> Self {
        let mut taken = VlArray::new_in(self.alloc.clone());
        taken.adopt(self);
        taken
    }

    /// Move construction with an explicit allocator.
    ///
    /// If `alloc` equals this array's allocator the block changes hands as in
    /// [`VlArray::take`]. Otherwise the elements are cloned into storage from
    /// `alloc` and this array keeps its contents.
    pub fn take_in(&mut self, alloc: A) -> Result<Self, AllocError>
    where
        T: Clone,
    {
        if alloc == self.alloc {
            let mut taken = VlArray::new_in(alloc);
            taken.adopt(self);
            return Ok(taken);
        }
        self.clone_in(alloc)
    }
}

impl<T, A: Allocator> Drop for VlArray<T, A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Clone, A: Allocator> Clone for VlArray<T, A>
where
    A::Pointer<T>: Unpin,
{
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(e) => panic!("failed to clone array of {} elements: {}", self.len, e),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if let Err(e) = Pin::new(self).assign_clone(source) {
            panic!("failed to clone array of {} elements: {}", source.len, e);
        }
    }
}

impl<T, A: Allocator + Default> Default for VlArray<T, A> {
    fn default() -> Self {
        VlArray::new_in(A::default())
    }
}

impl<T, A: Allocator> Deref for VlArray<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T, A: Allocator> DerefMut for VlArray<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a VlArray<T, A> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> slice::Iter<'a, T> {
        self.as_slice().iter()
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a mut VlArray<T, A> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> slice::IterMut<'a, T> {
        self.slice_mut().iter_mut()
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for VlArray<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T, U, A, B> PartialEq<VlArray<U, B>> for VlArray<T, A>
where
    T: PartialEq<U>,
    A: Allocator,
    B: Allocator,
{
    fn eq(&self, other: &VlArray<U, B>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq, A: Allocator> Eq for VlArray<T, A> {}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::format;

    use test_env_log::test;

    use crate::allocators::OffsetAlloc;

    assert_impl_all!(VlArray<u8>: Unpin, Clone, Default);
    assert_not_impl_any!(VlArray<u8, OffsetAlloc>: Unpin, Clone, Send);

    #[test]
    fn test_empty_arrays_own_nothing() {
        let array: VlArray<u64> = VlArray::from_elem(0, 1).unwrap();
        assert!(array.is_empty());
        assert!(array.as_ptr().is_null());
        assert_eq!(array.as_slice(), &[] as &[u64]);
        assert_eq!(format!("{:?}", array), "[]");
    }

    #[test]
    fn test_zero_sized_elements_have_a_handle() {
        let mut array: VlArray<()> = VlArray::with_len(3).unwrap();
        assert_eq!(array.len(), 3);
        assert!(!array.as_ptr().is_null());
        assert_eq!(array.iter().count(), 3);

        Pin::new(&mut array).clear();
        assert!(array.as_ptr().is_null());
    }

    #[test]
    fn test_offset_handles_follow_the_pinned_array() {
        let mut array = Box::pin(VlArray::<u32, OffsetAlloc>::new_in(OffsetAlloc));
        array
            .as_mut()
            .try_fill_with(4, |i| Ok::<u32, ()>(i as u32 * 10))
            .unwrap();
        assert_eq!(array.as_slice(), &[0, 10, 20, 30]);

        array.as_mut().as_mut_slice()[1] = 11;
        assert_eq!(array[1], 11);

        let copy = array.try_clone_pinned().unwrap();
        assert_eq!(*copy, *array);
        assert_ne!(copy.as_ptr(), array.as_ptr());
    }

    #[test]
    fn test_failed_refill_keeps_contents() {
        let mut array: VlArray<u8> = VlArray::from_elem(2, 5).unwrap();
        let before = array.as_ptr();
        let result = Pin::new(&mut array).try_fill_with(3, |i| if i == 1 { Err(i) } else { Ok(0) });
        assert_eq!(result, Err(Error::Construct(1)));
        assert_eq!(array.as_ptr(), before);
        assert_eq!(array.as_slice(), &[5, 5]);
    }
}

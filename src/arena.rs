//! A bump-allocating arena.
//!
//! An [`Arena`] serves every request by advancing a single offset into one
//! block it acquired up front. Nothing is ever reused: deallocation only logs.
//! The block can be copied wholesale to a new base address with
//! [`Arena::relocated`], which is what makes an arena a good home for
//! structures linked with [`OffsetPtr`](../offset_ptr/struct.OffsetPtr.html)s.
//!
//! ```text
//!   base                      base + offset              base + capacity
//!   ┌──────┬──────────┬──────┬──────────────────────────────┐
//!   │  A1  │    A2    │  A3  │          free                │
//!   └──────┴──────────┴──────┴──────────────────────────────┘
//! ```
//!
//! Blocks come from `alloc::alloc_zeroed`, or with the `use_libc` feature from
//! anonymous `mmap` pages.

use core::alloc::Layout;
use core::fmt;
use core::ptr::{self, NonNull};

use log::{debug, trace};
use spin::Mutex;

use crate::error::AllocError;

/// Alignment of every arena block, and so the largest alignment an arena can
/// serve. A relocated copy only keeps this much of the original's alignment.
pub const BLOCK_ALIGN: usize = 16;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// The memory behind an arena, zero-filled on acquisition.
struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

impl Block {
    // Dangling, but as aligned as a real block.
    fn empty() -> Block {
        Block {
            ptr: unsafe { NonNull::new_unchecked(BLOCK_ALIGN as *mut u8) },
            size: 0,
        }
    }

    #[cfg(not(feature = "use_libc"))]
    fn acquire(size: usize) -> Result<Block, AllocError> {
        if size == 0 {
            return Ok(Block::empty());
        }

        let layout =
            Layout::from_size_align(size, BLOCK_ALIGN).map_err(|_| AllocError::CapacityOverflow)?;
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| Block { ptr, size })
            .ok_or(AllocError::OutOfMemory {
                size,
                align: BLOCK_ALIGN,
            })
    }

    #[cfg(feature = "use_libc")]
    fn acquire(size: usize) -> Result<Block, AllocError> {
        if size == 0 {
            return Ok(Block::empty());
        }

        let pagesize = sysconf::page::pagesize();
        let to_map = round_up(size, pagesize);

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                ptr::null_mut(),
                to_map,
                libc::PROT_WRITE | libc::PROT_READ,
                // Private anonymous pages; they come back zeroed.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(AllocError::Map(errno::errno()));
        }

        NonNull::new(ptr as *mut u8)
            .map(|ptr| Block { ptr, size: to_map })
            .ok_or(AllocError::OutOfMemory {
                size: to_map,
                align: pagesize,
            })
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }

        #[cfg(not(feature = "use_libc"))]
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, BLOCK_ALIGN);
            alloc::alloc::dealloc(self.ptr.as_ptr(), layout);
        }

        #[cfg(feature = "use_libc")]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// A bump allocator over one contiguous, zero-initialised block.
pub struct Arena {
    block: Block,
    // Bytes handed out so far, counted from the block's base.
    offset: Mutex<usize>,
}

impl Arena {
    /// Acquire a block of at least `size` bytes. With `use_libc` the size is
    /// rounded up to whole pages.
    pub fn new(size: usize) -> Result<Arena, AllocError> {
        let block = Block::acquire(size)?;
        debug!("arena[{:p}] of size {} created", block.ptr, block.size);
        Ok(Arena {
            block,
            offset: Mutex::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.block.size
    }

    /// The fill level: bytes consumed so far, padding included.
    pub fn used(&self) -> usize {
        *self.offset.lock()
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn base(&self) -> NonNull<u8> {
        self.block.ptr
    }

    /// Whether `ptr` points into this arena's block.
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        let start = self.block.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr - start < self.block.size
    }

    /// Carve `layout.size()` bytes off the free end, aligned to
    /// `layout.align()`. Fails without side effects if they do not fit, or if
    /// the alignment is above [`BLOCK_ALIGN`].
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.align() > BLOCK_ALIGN {
            return Err(AllocError::UnsupportedAlignment {
                align: layout.align(),
                max: BLOCK_ALIGN,
            });
        }

        let mut offset = self.offset.lock();
        // The base is BLOCK_ALIGN-aligned in every copy, so aligning the
        // offset aligns the address.
        let start = round_up(*offset, layout.align());
        trace!(
            "arena[{:p}] allocating {} bytes from offset {}",
            self.block.ptr,
            layout.size(),
            start
        );

        let end = start
            .checked_add(layout.size())
            .filter(|&end| end <= self.block.size)
            .ok_or(AllocError::ArenaExhausted {
                requested: layout.size(),
                available: self.block.size.saturating_sub(start),
            })?;

        *offset = end;
        Ok(unsafe { NonNull::new_unchecked(self.block.ptr.as_ptr().add(start)) })
    }

    /// Arenas never reuse memory; this only records the request.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        trace!(
            "arena[{:p}] may deallocate {} bytes at {:p}",
            self.block.ptr,
            size,
            ptr
        );
    }

    /// Copy the used part of this arena verbatim into a new block at a
    /// different base, with the same capacity and fill level.
    ///
    /// Anything inside that refers to other things inside through offset
    /// pointers is still intact in the copy. Absolute pointers are not.
    pub fn relocated(&self) -> Result<Arena, AllocError> {
        let used = self.used();
        let copy = Arena::new(self.capacity())?;
        unsafe {
            ptr::copy_nonoverlapping(self.block.ptr.as_ptr(), copy.block.ptr.as_ptr(), used);
        }
        *copy.offset.lock() = used;

        debug!(
            "arena[{:p}] relocated {} bytes to arena[{:p}]",
            self.block.ptr, used, copy.block.ptr
        );
        Ok(copy)
    }

    /// The address in `other` at the same offset as `ptr` has in this arena.
    pub fn translate<T>(&self, ptr: *const T, other: &Arena) -> *mut T {
        debug_assert!(self.contains(ptr), "{:p} is not inside this arena", ptr);
        let offset = ptr as usize - self.block.ptr.as_ptr() as usize;
        other.block.ptr.as_ptr().wrapping_add(offset) as *mut T
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        debug!(
            "arena[{:p}] destroyed; final fill level was: {}",
            self.block.ptr,
            self.used()
        );
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.block.ptr)
            .field("capacity", &self.block.size)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_bump() {
        let arena = Arena::new(256).unwrap();
        let base = arena.base().as_ptr();
        assert_eq!(base as usize % BLOCK_ALIGN, 0);

        let a = arena.allocate(Layout::from_size_align(3, 1).unwrap()).unwrap();
        let b = arena.allocate(Layout::new::<u64>()).unwrap();
        let c = arena.allocate(Layout::from_size_align(1, 1).unwrap()).unwrap();
        log::info!("after three allocations: {:?}", arena);

        assert_eq!(a.as_ptr(), base);
        // 3 bytes, padded to 8 for the u64
        assert_eq!(b.as_ptr(), base.wrapping_add(8));
        assert_eq!(c.as_ptr(), base.wrapping_add(16));
        assert_eq!(arena.used(), 17);
        assert!(arena.contains(c.as_ptr()));
        assert!(!arena.contains(base.wrapping_add(arena.capacity())));
    }

    #[test]
    fn test_exhaustion_leaves_offset() {
        let arena = Arena::new(64).unwrap();
        let capacity = arena.capacity();
        arena
            .allocate(Layout::from_size_align(capacity - 16, 16).unwrap())
            .unwrap();

        let err = arena
            .allocate(Layout::from_size_align(32, 1).unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            AllocError::ArenaExhausted {
                requested: 32,
                available: 16
            }
        );
        assert_eq!(arena.used(), capacity - 16);
        assert_eq!(arena.remaining(), 16);
    }

    #[test]
    fn test_no_reuse() {
        let arena = Arena::new(64).unwrap();
        let layout = Layout::new::<u32>();
        let first = arena.allocate(layout).unwrap();
        arena.deallocate(first, layout.size());
        let second = arena.allocate(layout).unwrap();
        assert_ne!(first, second);
        assert_eq!(arena.used(), 8);
    }

    #[test]
    fn test_relocated_copies_contents() {
        let arena = Arena::new(128).unwrap();
        let bytes = arena.allocate(Layout::from_size_align(5, 1).unwrap()).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(b"hello".as_ptr(), bytes.as_ptr(), 5);
        }

        let copy = arena.relocated().unwrap();
        assert_ne!(copy.base(), arena.base());
        assert_eq!(copy.used(), 5);
        assert_eq!(copy.capacity(), arena.capacity());

        let moved = arena.translate(bytes.as_ptr(), &copy);
        assert!(copy.contains(moved));
        let moved = unsafe { core::slice::from_raw_parts(moved, 5) };
        assert_eq!(moved, b"hello");
    }

    #[test]
    fn test_alignment_survives_relocation() {
        let arena = Arena::new(512).unwrap();
        arena.allocate(Layout::from_size_align(1, 1).unwrap()).unwrap();
        let wide = arena
            .allocate(Layout::from_size_align(8, BLOCK_ALIGN).unwrap())
            .unwrap();
        assert_eq!(wide.as_ptr() as usize % BLOCK_ALIGN, 0);

        for _ in 0..8 {
            let copy = arena.relocated().unwrap();
            let moved = arena.translate(wide.as_ptr(), &copy);
            assert_eq!(moved as usize % BLOCK_ALIGN, 0, "{:?}", copy);
        }
    }

    #[test]
    fn test_rejects_over_aligned_layouts() {
        let arena = Arena::new(512).unwrap();
        arena.allocate(Layout::from_size_align(1, 1).unwrap()).unwrap();

        let err = arena
            .allocate(Layout::from_size_align(8, 64).unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            AllocError::UnsupportedAlignment {
                align: 64,
                max: BLOCK_ALIGN
            }
        );
        assert_eq!(arena.used(), 1);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 8), 24);
    }
}

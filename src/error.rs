//! Errors surfaced by allocators and by containers built on them.

use core::fmt;

#[cfg(feature = "use_libc")]
use errno::Errno;

/// Failure to obtain memory from an allocator.
///
/// Containers hand this back to their caller unchanged, without touching their
/// own state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The requested element count does not fit in a `Layout`.
    CapacityOverflow,
    /// The backing heap returned null for a request of this size.
    OutOfMemory { size: usize, align: usize },
    /// A bump arena does not have `requested` bytes left after alignment.
    ArenaExhausted { requested: usize, available: usize },
    /// A bump arena cannot serve alignments above the alignment of its block.
    UnsupportedAlignment { align: usize, max: usize },
    /// `mmap` failed while creating an arena block.
    #[cfg(feature = "use_libc")]
    Map(Errno),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::CapacityOverflow => write!(f, "capacity overflow"),
            AllocError::OutOfMemory { size, align } => {
                write!(f, "out of memory allocating {} bytes (align {})", size, align)
            }
            AllocError::ArenaExhausted {
                requested,
                available,
            } => write!(
                f,
                "arena exhausted: requested {} bytes, {} available",
                requested, available
            ),
            AllocError::UnsupportedAlignment { align, max } => write!(
                f,
                "alignment {} exceeds the arena maximum of {}",
                align, max
            ),
            #[cfg(feature = "use_libc")]
            AllocError::Map(errno) => write!(f, "mmap failed: {}", errno),
        }
    }
}

/// Failure of a container operation whose element constructor is fallible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error<E> {
    Alloc(AllocError),
    /// The element constructor returned an error. Every element built before
    /// it has already been dropped again.
    Construct(E),
}

impl<E> From<AllocError> for Error<E> {
    fn from(e: AllocError) -> Self {
        Error::Alloc(e)
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(e) => fmt::Display::fmt(e, f),
            Error::Construct(e) => write!(f, "element construction failed: {}", e),
        }
    }
}

impl Error<core::convert::Infallible> {
    /// Narrow an error from an infallible constructor to its allocation cause.
    pub fn into_alloc(self) -> AllocError {
        match self {
            Error::Alloc(e) => e,
            Error::Construct(never) => match never {},
        }
    }
}

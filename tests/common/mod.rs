#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::rc::Rc;

use offset_allocator::{AllocError, Allocator, CopySelection, Global, Propagation};

/// Bookkeeping shared by every `Tracked` in a test.
#[derive(Debug, Default)]
pub struct Ledger {
    live: Cell<isize>,
    // Clones left before the next one panics; `None` means unlimited.
    clone_budget: Cell<Option<usize>>,
    drops: RefCell<Vec<u32>>,
    // Id of the element whose next drop panics.
    fuse: Cell<Option<u32>>,
}

impl Ledger {
    pub fn new() -> Rc<Ledger> {
        Rc::new(Ledger::default())
    }

    pub fn live(&self) -> isize {
        self.live.get()
    }

    /// Allow `clones` more clones, then panic on the next one.
    pub fn arm(&self, clones: usize) {
        self.clone_budget.set(Some(clones));
    }

    pub fn disarm(&self) {
        self.clone_budget.set(None);
    }

    /// Make the next drop of element `id` panic, after it is recorded.
    pub fn panic_on_drop(&self, id: u32) {
        self.fuse.set(Some(id));
    }

    /// Ids in the order they were dropped, forgetting them.
    pub fn take_drops(&self) -> Vec<u32> {
        self.drops.borrow_mut().drain(..).collect()
    }
}

/// An element that reports its lifetime to a `Ledger`.
#[derive(Debug)]
pub struct Tracked {
    pub id: u32,
    ledger: Rc<Ledger>,
}

impl Tracked {
    pub fn new(id: u32, ledger: &Rc<Ledger>) -> Tracked {
        ledger.live.set(ledger.live.get() + 1);
        Tracked {
            id,
            ledger: Rc::clone(ledger),
        }
    }
}

impl Clone for Tracked {
    fn clone(&self) -> Tracked {
        if let Some(left) = self.ledger.clone_budget.get() {
            if left == 0 {
                panic!("clone of element {} refused", self.id);
            }
            self.ledger.clone_budget.set(Some(left - 1));
        }
        Tracked::new(self.id, &self.ledger)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ledger.live.set(self.ledger.live.get() - 1);
        self.ledger.drops.borrow_mut().push(self.id);
        if self.ledger.fuse.get() == Some(self.id) {
            self.ledger.fuse.set(None);
            panic!("drop of element {} failed", self.id);
        }
    }
}

impl PartialEq for Tracked {
    fn eq(&self, other: &Tracked) -> bool {
        self.id == other.id
    }
}

pub fn ids(tracked: &[Tracked]) -> Vec<u32> {
    tracked.iter().map(|t| t.id).collect()
}

/// Counters shared by a family of `CountingAlloc`s.
#[derive(Debug, Default)]
pub struct Stats {
    pub outstanding: Cell<isize>,
    pub allocations: Cell<usize>,
    pub fail_next: Cell<bool>,
}

impl Stats {
    pub fn new() -> Rc<Stats> {
        Rc::new(Stats::default())
    }
}

/// A heap allocator that counts blocks and can be told to fail. Instances are
/// equal when their ids are; `COPY` and `MOVE` set the propagation policy.
#[derive(Clone, Debug)]
pub struct CountingAlloc<const COPY: bool, const MOVE: bool> {
    id: u32,
    stats: Rc<Stats>,
}

pub type Plain = CountingAlloc<false, false>;
pub type Propagating = CountingAlloc<true, true>;

impl<const COPY: bool, const MOVE: bool> CountingAlloc<COPY, MOVE> {
    pub fn new(id: u32, stats: &Rc<Stats>) -> Self {
        CountingAlloc {
            id,
            stats: Rc::clone(stats),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl<const COPY: bool, const MOVE: bool> PartialEq for CountingAlloc<COPY, MOVE> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

unsafe impl<const COPY: bool, const MOVE: bool> Allocator for CountingAlloc<COPY, MOVE> {
    type Pointer<T> = *mut T;

    const PROPAGATION: Propagation = Propagation {
        on_copy_assign: COPY,
        on_move_assign: MOVE,
        select_on_copy: CopySelection::Share,
    };

    fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        if self.stats.fail_next.replace(false) {
            return Err(AllocError::OutOfMemory {
                size: core::mem::size_of::<T>() * count,
                align: core::mem::align_of::<T>(),
            });
        }
        let ptr = Global.allocate(count)?;
        self.stats.allocations.set(self.stats.allocations.get() + 1);
        self.stats.outstanding.set(self.stats.outstanding.get() + 1);
        Ok(ptr)
    }

    unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        self.stats.outstanding.set(self.stats.outstanding.get() - 1);
        Global.deallocate(ptr, count)
    }
}

//! Execution-stack regions and shared-stack pools.
//!
//! A coroutine runs on either a private [`StackRegion`] it owns for its
//! whole lifetime, or on a slot borrowed from a [`StackPool`]. Pool slots
//! are handed out by a rotating cursor with no ownership transfer: two
//! coroutines mapped to the same slot at different times are kept correct
//! by the save/restore pass in the coroutine layer, which copies the live
//! window of the displaced coroutine into a heap save-area before the slot
//! is reused.
//!
//! Region sizes are rounded up to a 4 KiB page multiple. Allocation
//! failure is fatal.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use corosensei::stack::{Stack as MachineStack, StackPointer};

use crate::coroutine::Coroutine;

/// Stack sizes are rounded up to this granularity.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to a non-zero page multiple.
pub fn round_to_page(size: usize) -> usize {
    size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE
}

// ---------------------------------------------------------------------------
// StackRegion
// ---------------------------------------------------------------------------

/// A page-aligned heap region used as a coroutine execution stack.
///
/// The `occupant` back-reference is only meaningful for pool slots: it
/// names the coroutine whose frames currently sit in the region, so the
/// next user knows whose live window to save first. It is weak on purpose;
/// a region never keeps a coroutine alive.
pub struct StackRegion {
    base: NonNull<u8>,
    len: usize,
    occupant: RefCell<Weak<Coroutine>>,
}

impl StackRegion {
    /// Allocate a region of at least `size` bytes, page-rounded.
    pub fn alloc(size: usize) -> Rc<StackRegion> {
        let len = round_to_page(size);
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .expect("stack region layout is always valid");
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        Rc::new(StackRegion {
            base,
            len,
            occupant: RefCell::new(Weak::new()),
        })
    }

    /// Region length in bytes (a page multiple).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowest address of the region.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// One past the highest address; stacks grow down from here.
    pub(crate) fn top_ptr(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    pub(crate) fn occupant(&self) -> Weak<Coroutine> {
        self.occupant.borrow().clone()
    }

    pub(crate) fn set_occupant(&self, co: Weak<Coroutine>) {
        *self.occupant.borrow_mut() = co;
    }

    pub(crate) fn clear_occupant(&self) {
        *self.occupant.borrow_mut() = Weak::new();
    }

    /// Whether `addr` lies inside the region.
    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE)
            .expect("stack region layout is always valid");
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

// ---------------------------------------------------------------------------
// Machine-stack handle
// ---------------------------------------------------------------------------

/// Handle presenting a [`StackRegion`] to the machine-context layer.
///
/// Holds its region alive but does not own it exclusively; for pool slots
/// the save/restore discipline in the coroutine layer makes concurrent
/// mapping of several coroutines onto one region sound.
pub(crate) struct RegionStack(pub(crate) Rc<StackRegion>);

unsafe impl MachineStack for RegionStack {
    fn base(&self) -> StackPointer {
        NonZeroUsize::new(self.0.top_ptr() as usize)
            .expect("stack region base address is never null")
    }

    fn limit(&self) -> StackPointer {
        NonZeroUsize::new(self.0.base_ptr() as usize)
            .expect("stack region base address is never null")
    }
}

// ---------------------------------------------------------------------------
// StackPool
// ---------------------------------------------------------------------------

/// A fixed set of equally sized stack regions shared among many coroutines.
///
/// Slot assignment is purely cursor-based: [`StackPool::next_slot`] rotates
/// through the array. Every region in the pool has the same byte length.
pub struct StackPool {
    slots: Vec<Rc<StackRegion>>,
    slot_size: usize,
    cursor: Cell<usize>,
}

impl StackPool {
    /// Create a pool of `count` regions of `size` bytes each (page-rounded).
    pub fn new(count: usize, size: usize) -> Rc<StackPool> {
        assert!(count > 0, "a stack pool needs at least one slot");
        let slot_size = round_to_page(size);
        let slots = (0..count).map(|_| StackRegion::alloc(slot_size)).collect();
        Rc::new(StackPool {
            slots,
            slot_size,
            cursor: Cell::new(0),
        })
    }

    /// The next slot under the rotating cursor.
    pub fn next_slot(&self) -> Rc<StackRegion> {
        let idx = self.cursor.get();
        self.cursor.set(idx.wrapping_add(1));
        self.slots[idx % self.slots.len()].clone()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

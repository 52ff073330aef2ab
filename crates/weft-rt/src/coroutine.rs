//! Stackful coroutines with private or shared execution stacks.
//!
//! A [`Coroutine`] is a unit of suspendable execution: a machine context,
//! a user entry closure, a lifecycle state, and a stack that is either a
//! private region or a rotating slot from a [`StackPool`]. Context switches
//! go through corosensei; this module adds the lifecycle bookkeeping and
//! the shared-stack eviction protocol on top.
//!
//! ## Shared-stack protocol
//!
//! Many coroutines can be mapped to one pool slot. Whenever control is
//! about to switch away from a coroutine, it samples a *marker*: the
//! address of a local on its own execution stack, an upper bound for its
//! live frames (stacks grow down). Before a coroutine is switched *to*,
//! [`Coroutine::make_resident`] makes its slot usable:
//!
//! 1. if another coroutine's frames occupy the slot, the window
//!    `[occupant.marker - reserve, slot top)` is copied into a save-area
//!    owned by the occupant (a terminated occupant is skipped and its
//!    save-area released);
//! 2. the slot's occupant back-reference moves to the incoming coroutine;
//! 3. the incoming coroutine's own save-area, if any, is copied back to
//!    the addresses it was taken from.
//!
//! The marker is re-sampled at *every* outgoing switch: a coroutine that
//! grows its stack between yields gets a fresh, deeper marker each time.
//!
//! The reserve accounts for the frames pushed after the marker is sampled:
//! the sampling function's own frame, the resume/suspend plumbing and the
//! register frame the machine switch spills, plus the ABI red zone. It is
//! why a coroutine may not resume another coroutine mapped onto the slot
//! it is itself running on: the caller's register frame is spilled after
//! any window could be saved. Every switch therefore tells
//! [`Coroutine::make_resident`] which coroutine's frames are executing
//! it, and an eviction of exactly that coroutine is refused before
//! anything is mutated.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use corosensei::{CoroutineResult, Yielder};
use log::warn;

use crate::config;
use crate::scheduler::Scheduler;
use crate::stack::{round_to_page, RegionStack, StackPool, StackRegion};

/// Bytes below the sampled marker included in a saved live window. Covers
/// the sampling frame, the switch plumbing's frames and spilled register
/// area, and the 128-byte red zone.
const SWITCH_RESERVE: usize = 1024;

type MachineCoroutine = corosensei::Coroutine<(), (), (), RegionStack>;

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Lifecycle state of a coroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoState {
    /// Constructed or suspended; may be resumed.
    Ready,
    /// On top of the invocation stack, executing.
    Running,
    /// Entry returned or panicked. Terminal.
    Terminated,
}

// ---------------------------------------------------------------------------
// Spawn attributes
// ---------------------------------------------------------------------------

/// Configuration for a new coroutine.
#[derive(Clone)]
pub struct CoroutineAttr {
    /// Private stack size in bytes, rounded up to a 4 KiB multiple.
    /// Ignored when a shared pool is set.
    pub stack_size: usize,
    /// Run on a rotating slot of this pool instead of a private stack.
    pub shared_pool: Option<Rc<StackPool>>,
}

impl Default for CoroutineAttr {
    fn default() -> Self {
        CoroutineAttr {
            stack_size: config::runtime().stack_size,
            shared_pool: None,
        }
    }
}

impl CoroutineAttr {
    /// Attributes selecting a slot of `pool`.
    pub fn pooled(pool: &Rc<StackPool>) -> Self {
        CoroutineAttr {
            stack_size: pool.slot_size(),
            shared_pool: Some(pool.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Coroutine
// ---------------------------------------------------------------------------

struct SavedStack {
    /// Lowest address the window was copied from; restore writes back here.
    window_base: *mut u8,
    bytes: Box<[u8]>,
}

struct Inner {
    /// Entry closure, consumed when the machine context is first built.
    entry: Option<Box<dyn FnOnce()>>,
    /// Machine context. `None` before the first resume, while the coroutine
    /// is running (the resumer holds it), and after termination.
    machine: Option<MachineCoroutine>,
    /// Live-window snapshot while evicted from a shared slot.
    saved: Option<SavedStack>,
}

/// A suspendable unit of execution owned by one worker thread.
pub struct Coroutine {
    id: u64,
    is_main: bool,
    state: Cell<CoState>,
    sched: Weak<Scheduler>,
    self_weak: Weak<Coroutine>,
    /// `None` only for the bootstrap coroutine, which runs on the thread's
    /// real stack.
    region: Option<Rc<StackRegion>>,
    uses_shared: bool,
    /// Sampled stack-pointer bound from the last outgoing switch.
    marker: Cell<*mut u8>,
    /// Erased `&Yielder<(), ()>` installed by the trampoline; valid while
    /// the coroutine is between its first resume and its termination.
    yielder: Cell<Option<NonNull<()>>>,
    inner: RefCell<Inner>,
}

impl Coroutine {
    /// Construct a READY coroutine on `sched`. Called through
    /// [`Scheduler::spawn`].
    pub(crate) fn new(
        sched: &Rc<Scheduler>,
        attr: &CoroutineAttr,
        entry: Box<dyn FnOnce()>,
    ) -> Rc<Coroutine> {
        let (region, uses_shared) = match &attr.shared_pool {
            Some(pool) => (pool.next_slot(), true),
            None => (StackRegion::alloc(round_to_page(attr.stack_size)), false),
        };
        Rc::new_cyclic(|self_weak| Coroutine {
            id: sched.next_id(),
            is_main: false,
            state: Cell::new(CoState::Ready),
            sched: Rc::downgrade(sched),
            self_weak: self_weak.clone(),
            region: Some(region),
            uses_shared,
            marker: Cell::new(ptr::null_mut()),
            yielder: Cell::new(None),
            inner: RefCell::new(Inner {
                entry: Some(entry),
                machine: None,
                saved: None,
            }),
        })
    }

    /// The bootstrap coroutine standing in for the worker thread's own
    /// stack. Always RUNNING while at the bottom of the invocation stack.
    pub(crate) fn bootstrap(sched: &Rc<Scheduler>) -> Rc<Coroutine> {
        Rc::new_cyclic(|self_weak| Coroutine {
            id: sched.next_id(),
            is_main: true,
            state: Cell::new(CoState::Running),
            sched: Rc::downgrade(sched),
            self_weak: self_weak.clone(),
            region: None,
            uses_shared: false,
            marker: Cell::new(ptr::null_mut()),
            yielder: Cell::new(None),
            inner: RefCell::new(Inner {
                entry: None,
                machine: None,
                saved: None,
            }),
        })
    }

    /// Identifier, unique per worker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoState {
        self.state.get()
    }

    /// Whether this is the worker's bootstrap coroutine.
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub(crate) fn state_cell_set(&self, state: CoState) {
        self.state.set(state);
    }

    /// Transfer control into this coroutine.
    ///
    /// May only be called on the scheduler that owns it, from whatever
    /// coroutine is currently running there. Resuming a TERMINATED
    /// coroutine is a silent no-op. The target must be READY and the
    /// current top RUNNING (asserted in debug builds).
    pub fn resume(self: &Rc<Self>) {
        if self.state.get() == CoState::Terminated {
            return;
        }
        let Some(sched) = self.sched.upgrade() else {
            warn!("resume on coroutine {} after scheduler teardown", self.id);
            return;
        };
        if self.state.get() != CoState::Ready {
            debug_assert!(false, "resume target must be READY");
            warn!("ignoring resume of non-ready coroutine {}", self.id);
            return;
        }
        let prev = sched.running();
        debug_assert_eq!(prev.state.get(), CoState::Running);
        debug_assert!(!Rc::ptr_eq(&prev, self), "a coroutine cannot resume itself");

        prev.sample_marker();
        // residency is settled before any state or stack mutation so a
        // rejected switch aborts with nothing to undo
        if !self.make_resident(Some(&prev)) {
            warn!(
                "ignoring resume of coroutine {}: its slot holds the caller's live frames",
                self.id
            );
            return;
        }

        if !prev.is_main {
            prev.state.set(CoState::Ready);
        }
        self.state.set(CoState::Running);
        sched.push(self.clone());
        self.ensure_machine();

        let mut machine = self
            .inner
            .borrow_mut()
            .machine
            .take()
            .expect("a READY coroutine always has a machine context");
        match machine.resume(()) {
            CoroutineResult::Yield(()) => {
                self.inner.borrow_mut().machine = Some(machine);
            }
            CoroutineResult::Return(()) => {
                // the trampoline already unwound the invocation stack and
                // marked the state; only the carcass is left to clean up
                drop(machine);
                self.release_terminated();
            }
        }
    }

    /// Record the address of a live local as the stack-pointer bound for
    /// a following switch away from this coroutine.
    #[inline(never)]
    pub(crate) fn sample_marker(&self) {
        let mut probe: u8 = 0;
        self.marker.set(std::hint::black_box(&mut probe as *mut u8));
    }

    /// Suspend this (running) coroutine. The scheduler has already
    /// settled the pending coroutine's residency, popped the stack and
    /// fixed both states; all that is left is the machine switch.
    pub(crate) fn suspend_raw(&self) {
        let ptr = self
            .yielder
            .get()
            .expect("a suspending coroutine always has an active yielder");
        let yielder: &Yielder<(), ()> = unsafe { ptr.cast::<Yielder<(), ()>>().as_ref() };
        yielder.suspend(());
        // running again; the resumer restored state and residency
    }

    /// Make this coroutine's stack usable: for a shared slot, save the
    /// current occupant's live window, take the slot, and copy this
    /// coroutine's own saved window back. No-op for private stacks, the
    /// bootstrap, and a slot already held.
    ///
    /// `active` names the coroutine whose native frames are executing
    /// this switch. If that coroutine is the occupant, the slot cannot be
    /// taken: its frames are in use right now and its register frame for
    /// the upcoming switch does not exist yet, so no save window could
    /// cover it. Returns `false` (debug builds assert) and leaves the
    /// slot untouched in that case. Lifecycle state cannot stand in for
    /// this check: every caller flips states around the switch, so the
    /// occupant's state says nothing about whose frames are live.
    #[must_use]
    pub(crate) fn make_resident(&self, active: Option<&Coroutine>) -> bool {
        if !self.uses_shared {
            return true;
        }
        let region = self
            .region
            .as_ref()
            .expect("a shared-stack coroutine always has a region");
        if Weak::ptr_eq(&region.occupant(), &self.self_weak) {
            return true;
        }
        if let Some(occupant) = region.occupant().upgrade() {
            if let Some(active) = active {
                if std::ptr::eq(Rc::as_ptr(&occupant), active) {
                    debug_assert!(
                        false,
                        "cannot displace the coroutine whose frames are executing this switch"
                    );
                    return false;
                }
            }
            if occupant.state.get() == CoState::Terminated {
                occupant.inner.borrow_mut().saved = None;
            } else {
                occupant.save_live_window(region);
            }
        }
        region.set_occupant(self.self_weak.clone());
        if let Some(saved) = self.inner.borrow_mut().saved.take() {
            // restore to the exact addresses the window came from
            unsafe {
                ptr::copy_nonoverlapping(saved.bytes.as_ptr(), saved.window_base, saved.bytes.len());
            }
        }
        true
    }

    /// Copy the live window `[marker - reserve, slot top)` into a fresh
    /// save-area. Called on the displaced occupant of a shared slot.
    fn save_live_window(&self, region: &StackRegion) {
        let marker = self.marker.get();
        debug_assert!(
            region.contains(marker),
            "stack-pointer marker was not sampled on the shared slot"
        );
        let top = region.top_ptr() as usize;
        let mut start = (marker as usize).saturating_sub(SWITCH_RESERVE);
        start &= !15usize;
        start = start.max(region.base_ptr() as usize);
        let len = top - start;
        let mut bytes = vec![0u8; len].into_boxed_slice();
        unsafe {
            ptr::copy_nonoverlapping(start as *const u8, bytes.as_mut_ptr(), len);
        }
        self.inner.borrow_mut().saved = Some(SavedStack {
            window_base: start as *mut u8,
            bytes,
        });
    }

    /// Build the machine context on first resume. Deferred until the stack
    /// is resident because construction writes the initial switch frame
    /// into the region.
    fn ensure_machine(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.machine.is_some() {
            return;
        }
        let entry = inner
            .entry
            .take()
            .expect("a READY coroutine that was never run still has its entry");
        let region = self
            .region
            .clone()
            .expect("only the bootstrap coroutine lacks a stack region");
        let self_weak = self.self_weak.clone();
        inner.machine = Some(corosensei::Coroutine::with_stack(
            RegionStack(region),
            move |yielder, ()| trampoline(self_weak, yielder, entry),
        ));
    }

    /// Drop what a terminated coroutine no longer needs. Its region is
    /// released with the coroutine itself; a shared slot is handed back as
    /// vacant so the next user skips the save pass.
    fn release_terminated(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.saved = None;
        inner.entry = None;
        self.yielder.set(None);
        if self.uses_shared {
            if let Some(region) = &self.region {
                if Weak::ptr_eq(&region.occupant(), &self.self_weak) {
                    region.clear_occupant();
                }
            }
        }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // Dropping a suspended machine context unwinds its frames, which
        // runs on its stack; a shared slot must be resident for that. The
        // frames executing this drop belong to whichever coroutine is
        // running on this worker right now.
        let machine = self.inner.borrow_mut().machine.take();
        if let Some(machine) = machine {
            if machine.done() {
                drop(machine);
            } else {
                let active = self.sched.upgrade().map(|sched| sched.running());
                if self.make_resident(active.as_deref()) {
                    drop(machine);
                } else {
                    warn!(
                        "leaking suspended coroutine {}: its slot holds the running coroutine's frames",
                        self.id
                    );
                    std::mem::forget(machine);
                }
            }
        }
        if let Some(region) = &self.region {
            if Weak::ptr_eq(&region.occupant(), &self.self_weak) {
                region.clear_occupant();
            }
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("main", &self.is_main)
            .field("shared_stack", &self.uses_shared)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trampoline
// ---------------------------------------------------------------------------

/// First frame of every non-bootstrap coroutine.
///
/// Installs the yielder, runs the entry closure, and performs the terminal
/// switch bookkeeping. Entry panics are caught and logged; the coroutine
/// still terminates and nothing propagates to the resumer. Non-string
/// panic payloads are re-raised so a cancellation unwind passes through
/// intact.
///
/// Holds no strong reference across suspension points: a coroutine must
/// not keep itself alive through its own stack.
fn trampoline(self_weak: Weak<Coroutine>, yielder: &Yielder<(), ()>, entry: Box<dyn FnOnce()>) {
    if let Some(co) = self_weak.upgrade() {
        co.yielder
            .set(NonNull::new(yielder as *const Yielder<(), ()> as *mut ()));
    }

    if let Err(payload) = catch_unwind(AssertUnwindSafe(entry)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .map(str::to_owned)
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match message {
            Some(message) => {
                let id = self_weak.upgrade().map(|co| co.id).unwrap_or(u64::MAX);
                warn!("coroutine {id} terminated by panic: {message}");
            }
            None => resume_unwind(payload),
        }
    }

    let Some(co) = self_weak.upgrade() else { return };
    co.state.set(CoState::Terminated);
    if let Some(sched) = co.sched.upgrade() {
        sched.finish(&co);
    }
    // returning performs the final switch back to the resumer
}

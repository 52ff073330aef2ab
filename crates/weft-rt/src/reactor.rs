//! Edge-triggered I/O reactor with an embedded timer wheel.
//!
//! One reactor per worker thread, created lazily like the scheduler. It
//! multiplexes kernel readiness notifications over registered descriptors
//! and drives the timer wheel from the same loop:
//!
//! ```text
//! loop {
//!     timeout = next wheel expiry, capped at 1000 ms
//!     wait for readiness (up to 256 events)
//!     dispatch: read handler, then write handler, per descriptor
//!     advance the wheel; fire expired timers
//! }
//! ```
//!
//! Registrations are edge-triggered: a handler is expected to drain its
//! descriptor until the kernel reports `EAGAIN`, because no further
//! notification arrives until new data or space appears.
//!
//! Per direction, an event context carries either a callback or a
//! coroutine to resume; the callback wins if both are present. Coroutine
//! references are weak: the reactor never keeps a coroutine alive, and a
//! reference whose target is gone is dropped the next time dispatch
//! touches it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, warn};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use rustc_hash::FxHashMap;

use crate::config;
use crate::coroutine::{CoState, Coroutine};
use crate::fd::{set_nonblock_raw, FdRegistry};
use crate::timer::{now_ms, TimerWheel};

/// Ceiling on how long one loop iteration blocks in the kernel.
pub const WHEEL_CAP_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Interest mask
// ---------------------------------------------------------------------------

/// Readiness interest bit field. The encoding (READ = 1, WRITE = 4) is
/// wire-compatible with the kernel-facing constants used on descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b100);

    /// All bits of `other` are set in `self`.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set in `self`.
    pub fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (
        interest.contains(Interest::READ),
        interest.contains(Interest::WRITE),
    ) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        (false, false) => unreachable!("empty interest never reaches the kernel"),
    }
}

// ---------------------------------------------------------------------------
// Event context
// ---------------------------------------------------------------------------

type ReadyCallback = Box<dyn FnMut()>;

/// Per-descriptor registration state.
#[derive(Default)]
struct EventCtx {
    interest: Interest,
    read_cb: Option<ReadyCallback>,
    write_cb: Option<ReadyCallback>,
    read_co: Option<Weak<Coroutine>>,
    write_co: Option<Weak<Coroutine>>,
    user: Option<Box<dyn Any>>,
}

enum Dispatch {
    Callback(ReadyCallback),
    Resume(Rc<Coroutine>),
    Nothing,
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

thread_local! {
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// One worker thread's readiness multiplexer.
pub struct Reactor {
    poll: RefCell<Poll>,
    contexts: RefCell<FxHashMap<RawFd, EventCtx>>,
    wheel: RefCell<TimerWheel>,
    stopped: Cell<bool>,
    max_events: usize,
}

impl Reactor {
    /// This thread's reactor, created on first use.
    pub fn current_thread() -> Rc<Reactor> {
        REACTOR.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                crate::hook::initialize();
                *slot = Some(Rc::new(
                    Reactor::new().expect("could not create the kernel readiness monitor"),
                ));
            }
            slot.as_ref().expect("just initialized").clone()
        })
    }

    fn new() -> io::Result<Reactor> {
        let cfg = config::runtime();
        Ok(Reactor {
            poll: RefCell::new(Poll::new()?),
            contexts: RefCell::new(FxHashMap::default()),
            wheel: RefCell::new(TimerWheel::new(cfg.wheel_slots, cfg.wheel_granularity_ms)),
            stopped: Cell::new(false),
            max_events: cfg.max_events,
        })
    }

    /// Install or merge interest in `fd`.
    ///
    /// The descriptor is forced non-blocking. For each direction named in
    /// `interest`, the given callback/coroutine pair replaces whatever the
    /// context held for that direction; a direction with neither handler
    /// is illegal. Returns `false` if the kernel registration failed.
    pub fn register(
        &self,
        interest: Interest,
        fd: RawFd,
        read_cb: Option<ReadyCallback>,
        write_cb: Option<ReadyCallback>,
        read_co: Option<&Rc<Coroutine>>,
        write_co: Option<&Rc<Coroutine>>,
    ) -> bool {
        debug_assert!(!interest.is_empty(), "registering empty interest");
        debug_assert!(
            !interest.contains(Interest::READ) || read_cb.is_some() || read_co.is_some(),
            "READ interest needs a callback or a coroutine"
        );
        debug_assert!(
            !interest.contains(Interest::WRITE) || write_cb.is_some() || write_co.is_some(),
            "WRITE interest needs a callback or a coroutine"
        );
        match set_nonblock_raw(fd) {
            Ok(()) => FdRegistry::note_nonblock(fd),
            Err(e) => warn!("could not set fd {fd} non-blocking: {e}"),
        }

        let mut contexts = self.contexts.borrow_mut();
        let existed = contexts.contains_key(&fd);
        let ctx = contexts.entry(fd).or_default();
        ctx.interest |= interest;
        if interest.contains(Interest::READ) {
            ctx.read_cb = read_cb;
            ctx.read_co = read_co.map(Rc::downgrade);
        }
        if interest.contains(Interest::WRITE) {
            ctx.write_cb = write_cb;
            ctx.write_co = write_co.map(Rc::downgrade);
        }
        let merged = ctx.interest;

        let poll = self.poll.borrow();
        let registry = poll.registry();
        let mut source = SourceFd(&fd);
        let result = if existed {
            registry.reregister(&mut source, Token(fd as usize), to_mio(merged))
        } else {
            registry.register(&mut source, Token(fd as usize), to_mio(merged))
        };
        if let Err(e) = result {
            warn!("kernel registration for fd {fd} failed: {e}");
            if !existed {
                contexts.remove(&fd);
            }
            return false;
        }
        true
    }

    /// Attach opaque user data to an existing registration.
    pub fn set_user_data(&self, fd: RawFd, user: Box<dyn Any>) -> bool {
        match self.contexts.borrow_mut().get_mut(&fd) {
            Some(ctx) => {
                ctx.user = Some(user);
                true
            }
            None => false,
        }
    }

    /// Detach and return the user data attached to `fd`.
    pub fn take_user_data(&self, fd: RawFd) -> Option<Box<dyn Any>> {
        self.contexts.borrow_mut().get_mut(&fd)?.user.take()
    }

    /// Clear interest bits on `fd`. Pending handlers for the cleared
    /// directions are dropped without being invoked; when no interest
    /// remains the descriptor is deregistered. Unknown descriptors are a
    /// silent no-op. Returns `false` if the kernel update failed.
    pub fn cancel(&self, interest: Interest, fd: RawFd) -> bool {
        let mut contexts = self.contexts.borrow_mut();
        let Some(ctx) = contexts.get_mut(&fd) else {
            return true;
        };
        if !ctx.interest.intersects(interest) {
            return true;
        }
        if interest.contains(Interest::READ) {
            ctx.read_cb = None;
            ctx.read_co = None;
            ctx.interest.remove(Interest::READ);
        }
        if interest.contains(Interest::WRITE) {
            ctx.write_cb = None;
            ctx.write_co = None;
            ctx.interest.remove(Interest::WRITE);
        }
        let remaining = ctx.interest;

        let poll = self.poll.borrow();
        let registry = poll.registry();
        let mut source = SourceFd(&fd);
        let result = if remaining.is_empty() {
            contexts.remove(&fd);
            registry.deregister(&mut source)
        } else {
            registry.reregister(&mut source, Token(fd as usize), to_mio(remaining))
        };
        if let Err(e) = result {
            warn!("kernel deregistration for fd {fd} failed: {e}");
            return false;
        }
        true
    }

    /// Schedule a timeout on this reactor's wheel. The coroutine, if
    /// given, wins over the callback when the timer fires. `repeat` of -1
    /// repeats forever.
    pub fn add_timer(
        &self,
        timeout_ms: u64,
        callback: Option<Box<dyn FnMut()>>,
        co: Option<&Rc<Coroutine>>,
        repeat: i64,
    ) {
        self.wheel
            .borrow_mut()
            .add(timeout_ms, callback, co.map(Rc::downgrade), repeat);
    }

    /// Run the event loop until [`stop`](Reactor::stop) is called.
    pub fn event_loop(&self) {
        let mut events = Events::with_capacity(self.max_events);
        while !self.stopped.get() {
            let next = self.wheel.borrow().next_timeout(now_ms());
            let timeout = if next == 0 { 1 } else { next.min(WHEEL_CAP_MS) };
            let poll_result = self
                .poll
                .borrow_mut()
                .poll(&mut events, Some(Duration::from_millis(timeout)));
            match poll_result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!("readiness wait failed: {e}"),
            }
            for event in events.iter() {
                let fd = event.token().0 as RawFd;
                let readable =
                    event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                if readable {
                    self.dispatch(fd, Interest::READ);
                }
                if writable {
                    self.dispatch(fd, Interest::WRITE);
                }
            }
            self.tick();
        }
        self.stopped.set(false);
    }

    /// Ask the event loop to exit after its current iteration.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// Run one direction's handler for a ready descriptor. The handler is
    /// pulled out of the context first so it can re-enter the reactor.
    fn dispatch(&self, fd: RawFd, direction: Interest) {
        let action = {
            let mut contexts = self.contexts.borrow_mut();
            let Some(ctx) = contexts.get_mut(&fd) else {
                return;
            };
            if !ctx.interest.contains(direction) {
                return;
            }
            let (cb, co) = if direction == Interest::READ {
                (&mut ctx.read_cb, &mut ctx.read_co)
            } else {
                (&mut ctx.write_cb, &mut ctx.write_co)
            };
            if let Some(cb) = cb.take() {
                Dispatch::Callback(cb)
            } else {
                match co.as_ref().map(Weak::upgrade) {
                    Some(Some(target)) if target.state() == CoState::Ready => {
                        Dispatch::Resume(target)
                    }
                    Some(_) => {
                        // dead, terminated or otherwise unresumable target:
                        // drop the reference
                        debug!("dropping stale resume target for fd {fd}");
                        *co = None;
                        Dispatch::Nothing
                    }
                    None => Dispatch::Nothing,
                }
            }
        };
        match action {
            Dispatch::Callback(mut cb) => {
                if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                    warn!("ready handler for fd {fd} panicked");
                }
                // hand the callback back unless the handler replaced or
                // cancelled it
                let mut contexts = self.contexts.borrow_mut();
                if let Some(ctx) = contexts.get_mut(&fd) {
                    let slot = if direction == Interest::READ {
                        &mut ctx.read_cb
                    } else {
                        &mut ctx.write_cb
                    };
                    if slot.is_none() && ctx.interest.contains(direction) {
                        *slot = Some(cb);
                    }
                }
            }
            Dispatch::Resume(co) => co.resume(),
            Dispatch::Nothing => {}
        }
    }

    /// Advance the wheel and fire what came due.
    fn tick(&self) {
        let due = self.wheel.borrow_mut().advance(now_ms());
        for mut item in due {
            if item.fire() {
                self.wheel.borrow_mut().reinsert(item);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered", &self.contexts.borrow().len())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

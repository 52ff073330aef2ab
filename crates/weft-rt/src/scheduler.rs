//! Per-worker cooperative scheduler.
//!
//! Each worker thread owns exactly one scheduler, lazily created on first
//! use with a bootstrap coroutine standing in for the thread's own stack.
//! The scheduler is an explicit *invocation stack* of coroutines: resume
//! pushes the target, yield pops the top and returns control to the
//! coroutine underneath. The bootstrap sits at index 0 forever and never
//! suspends. The stack depth is observable, which the syscall hook layer
//! uses to decide whether yielding is legal.
//!
//! All scheduler state is thread-local; nothing here is shared across
//! workers. Parallelism is achieved by running more worker threads, each
//! with its own scheduler, reactor and FD registry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::warn;

use crate::coroutine::{CoState, Coroutine, CoroutineAttr};
use crate::error::{Error, Result};

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// One worker thread's scheduler.
pub struct Scheduler {
    stack: RefCell<Vec<Rc<Coroutine>>>,
    next_id: Cell<u64>,
}

impl Scheduler {
    /// This thread's scheduler, created on first use together with its
    /// bootstrap coroutine.
    pub fn current_thread() -> Rc<Scheduler> {
        SCHEDULER.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                crate::hook::initialize();
                let sched = Rc::new(Scheduler {
                    stack: RefCell::new(Vec::new()),
                    next_id: Cell::new(0),
                });
                let main = Coroutine::bootstrap(&sched);
                sched.stack.borrow_mut().push(main);
                *slot = Some(sched);
            }
            slot.as_ref().expect("just initialized").clone()
        })
    }

    /// Create a READY coroutine on this scheduler.
    pub fn spawn<F>(self: &Rc<Self>, attr: &CoroutineAttr, entry: F) -> Rc<Coroutine>
    where
        F: FnOnce() + 'static,
    {
        Coroutine::new(self, attr, Box::new(entry))
    }

    /// The RUNNING coroutine: the top of the invocation stack.
    pub fn current(&self) -> Rc<Coroutine> {
        self.running()
    }

    /// Number of coroutines on the invocation stack. At least 1; a depth
    /// of 1 means only the bootstrap is running and yielding is illegal.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Suspend the running coroutine and return control to its resumer.
    ///
    /// Returns [`Error::IllegalYield`] when only the bootstrap coroutine
    /// is on the stack. On success the caller is suspended until resumed
    /// again, at which point this returns `Ok(())`.
    pub fn try_yield(&self) -> Result<()> {
        let (running, pending) = {
            let stack = self.stack.borrow();
            if stack.len() < 2 {
                return Err(Error::IllegalYield);
            }
            (
                stack[stack.len() - 1].clone(),
                stack[stack.len() - 2].clone(),
            )
        };
        running.sample_marker();
        // settle the resumer's residency before touching states or the
        // stack; its frames cannot be on the yielder's own slot, or the
        // resume that got us here would have been refused
        if !pending.make_resident(Some(&running)) {
            warn!(
                "ignoring yield of coroutine {}: its resumer's slot holds its own live frames",
                running.id()
            );
            return Ok(());
        }
        self.stack.borrow_mut().pop();
        running.state_cell_set(CoState::Ready);
        pending.state_cell_set(CoState::Running);
        running.suspend_raw();
        Ok(())
    }

    /// [`try_yield`](Scheduler::try_yield), with the contract violation
    /// downgraded to an assertion: debug builds abort, release builds log
    /// and continue without suspending.
    pub fn yield_now(&self) {
        if let Err(e) = self.try_yield() {
            debug_assert!(false, "{e}");
            warn!("{e}");
        }
    }

    // -- crate-internal bookkeeping --

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub(crate) fn running(&self) -> Rc<Coroutine> {
        self.stack
            .borrow()
            .last()
            .expect("the invocation stack always holds the bootstrap coroutine")
            .clone()
    }

    pub(crate) fn push(&self, co: Rc<Coroutine>) {
        self.stack.borrow_mut().push(co);
    }

    /// Terminal unwind of the invocation stack, run by the trampoline just
    /// before a finished coroutine switches back to its resumer.
    pub(crate) fn finish(&self, co: &Rc<Coroutine>) {
        let pending = {
            let mut stack = self.stack.borrow_mut();
            match stack.last() {
                Some(top) if Rc::ptr_eq(top, co) => {
                    stack.pop();
                }
                _ => {
                    // never reached by a balanced resume/yield flow
                    warn!("coroutine {} finished while not on top", co.id());
                    return;
                }
            }
            stack
                .last()
                .expect("the invocation stack always holds the bootstrap coroutine")
                .clone()
        };
        pending.state_cell_set(CoState::Running);
        // the finishing coroutine's frames are still executing here
        if !pending.make_resident(Some(co.as_ref())) {
            warn!(
                "resumer of finished coroutine {} could not reclaim its slot",
                co.id()
            );
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Spawn a coroutine with default attributes on this thread's scheduler.
pub fn spawn<F>(entry: F) -> Rc<Coroutine>
where
    F: FnOnce() + 'static,
{
    Scheduler::current_thread().spawn(&CoroutineAttr::default(), entry)
}

/// Yield the running coroutine on this thread's scheduler.
pub fn yield_now() {
    Scheduler::current_thread().yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn bootstrap_is_lazy_and_running() {
        let sched = Scheduler::current_thread();
        assert_eq!(sched.depth(), 1);
        let main = sched.current();
        assert!(main.is_main());
        assert_eq!(main.state(), CoState::Running);
        assert!(Rc::ptr_eq(&sched, &Scheduler::current_thread()));
    }

    #[test]
    fn yield_on_bootstrap_is_illegal() {
        let sched = Scheduler::current_thread();
        assert!(matches!(sched.try_yield(), Err(Error::IllegalYield)));
    }

    #[test]
    fn spawn_resume_run_to_completion() {
        let sched = Scheduler::current_thread();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let co = sched.spawn(&CoroutineAttr::default(), move || flag.set(true));
        assert_eq!(co.state(), CoState::Ready);
        co.resume();
        assert!(ran.get());
        assert_eq!(co.state(), CoState::Terminated);
        assert_eq!(sched.depth(), 1);
    }

    #[test]
    fn yield_suspends_and_resume_continues() {
        let sched = Scheduler::current_thread();
        let step = Rc::new(Cell::new(0));
        let s = step.clone();
        let co = sched.spawn(&CoroutineAttr::default(), move || {
            s.set(1);
            yield_now();
            s.set(2);
        });
        co.resume();
        assert_eq!(step.get(), 1);
        assert_eq!(co.state(), CoState::Ready);
        co.resume();
        assert_eq!(step.get(), 2);
        assert_eq!(co.state(), CoState::Terminated);
    }

    #[test]
    fn resume_terminated_is_a_no_op() {
        let sched = Scheduler::current_thread();
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let co = sched.spawn(&CoroutineAttr::default(), move || r.set(r.get() + 1));
        co.resume();
        co.resume();
        assert_eq!(runs.get(), 1);
        assert_eq!(co.state(), CoState::Terminated);
    }

    #[test]
    fn exactly_one_running_at_any_depth() {
        let sched = Scheduler::current_thread();
        let observed = Rc::new(Cell::new(0usize));
        let obs = observed.clone();
        let sched2 = sched.clone();
        let co = sched.spawn(&CoroutineAttr::default(), move || {
            // while this coroutine runs, it is the single RUNNING one
            assert_eq!(sched2.current().state(), CoState::Running);
            assert_eq!(sched2.depth(), 2);
            obs.set(obs.get() + 1);
        });
        co.resume();
        assert_eq!(observed.get(), 1);
        assert_eq!(sched.current().state(), CoState::Running);
        assert!(sched.current().is_main());
    }

    #[test]
    fn panicking_entry_terminates_quietly() {
        let sched = Scheduler::current_thread();
        let co = sched.spawn(&CoroutineAttr::default(), || panic!("boom"));
        co.resume();
        assert_eq!(co.state(), CoState::Terminated);
        // the worker is intact and can run more coroutines
        let ok = Rc::new(Cell::new(false));
        let f = ok.clone();
        let co2 = sched.spawn(&CoroutineAttr::default(), move || f.set(true));
        co2.resume();
        assert!(ok.get());
    }
}

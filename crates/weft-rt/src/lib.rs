//! Weft runtime library.
//!
//! A single-process, user-space concurrency runtime: stackful coroutines
//! multiplexed cooperatively on worker threads, an edge-triggered I/O
//! reactor with a hashed timer wheel, and an interception layer that turns
//! blocking syscalls issued from coroutines into cooperative waits.
//! Ordinary-looking sequential code runs without blocking its OS thread.
//!
//! ## Modules
//!
//! - [`stack`]: stack regions, private or pooled, with rotating shared
//!   slots
//! - [`coroutine`]: the suspendable execution unit and the shared-stack
//!   save/restore protocol
//! - [`scheduler`]: one per worker thread; an explicit invocation stack
//!   with resume/yield primitives
//! - [`timer`]: hashed timer wheel, one-shot and repeating entries
//! - [`reactor`]: readiness multiplexing and the per-worker event loop
//! - [`fd`]: per-thread descriptor metadata consulted by the hook layer
//! - [`hook`]: process-wide symbol interposition of the blocking
//!   syscalls (sleep/usleep, the read and write families, close)
//! - [`config`]: process-global runtime configuration
//!
//! ## Worker model
//!
//! Every worker thread lazily owns one scheduler, one reactor and one FD
//! registry; none of them are shared or locked. An application spawns
//! coroutines on the scheduler, resumes them, and drives
//! [`Reactor::event_loop`] from the thread's bootstrap coroutine. Workers
//! scale by running more threads; coroutines, timers and registrations
//! never migrate between them.
//!
//! ```no_run
//! use weft_rt::{CoroutineAttr, Reactor, Scheduler};
//!
//! let sched = Scheduler::current_thread();
//! let co = sched.spawn(&CoroutineAttr::default(), || {
//!     // hooked calls suspend this coroutine instead of the thread
//!     weft_rt::hook::sleep(1);
//! });
//! co.resume();
//! Reactor::current_thread().event_loop();
//! ```

pub mod config;
pub mod coroutine;
pub mod error;
pub mod fd;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod timer;

pub use config::RuntimeConfig;
pub use coroutine::{CoState, Coroutine, CoroutineAttr};
pub use error::{Error, Result};
pub use fd::{FdContext, FdRegistry, TimeoutKind, NO_TIMEOUT};
pub use reactor::{Interest, Reactor, WHEEL_CAP_MS};
pub use scheduler::{spawn, yield_now, Scheduler};
pub use stack::{StackPool, StackRegion};
pub use timer::{now_ms, TimerWheel, REPEAT_FOREVER};

//! Close-cancels-waits semantics, isolated in its own process so the
//! closed descriptor number cannot be recycled by a concurrent test
//! between the close and the timer-driven retry.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

use weft_rt::{hook, CoState, CoroutineAttr, FdRegistry, Reactor, Scheduler};

/// Closing a descriptor cancels the reactor wait silently: the parked
/// coroutine is never resumed by readiness and must be woken by a timer,
/// after which its retry observes the closed descriptor.
#[test]
fn close_cancels_pending_recv() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut sv = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
        0
    );
    let (ours, theirs) = (sv[0], sv[1]);
    let ctx = FdRegistry::get(ours, true).unwrap();
    ctx.set_nonblock(true);
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let result = Rc::new(Cell::new(1isize));

    let co = {
        let result = result.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            let mut buf = [0u8; 16];
            let n = unsafe {
                hook::recv(ours, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            result.set(n);
        })
    };
    co.resume();
    assert_eq!(co.state(), CoState::Ready);

    // drop the wait; the coroutine stays parked and readiness on the peer
    // side can no longer reach it
    unsafe { hook::close(ours) };
    let n = unsafe {
        libc::send(
            theirs,
            b"x".as_ptr() as *const libc::c_void,
            1,
            libc::MSG_NOSIGNAL,
        )
    };
    // the peer may already observe the close; either way no resume happens
    let _ = n;

    // only this timer can wake it now
    reactor.add_timer(50, None, Some(&co), 1);
    let r = reactor.clone();
    reactor.add_timer(400, Some(Box::new(move || r.stop())), None, 1);
    reactor.event_loop();

    assert_eq!(co.state(), CoState::Terminated);
    // the retried recv hit the closed descriptor
    assert_eq!(result.get(), -1);

    unsafe {
        libc::close(theirs);
    }
}

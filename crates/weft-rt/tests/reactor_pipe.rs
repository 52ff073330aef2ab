//! Edge-triggered readiness dispatch over a pipe pair.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use weft_rt::{Interest, Reactor};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

/// A writer thread pushes 500 single bytes through a pipe; the read-end
/// handler drains on every edge and accounts for all of them. The
/// write-end handler observes at least the initial writability edge.
#[test]
fn pipe_edges_deliver_every_byte() {
    init_logging();
    let (rfd, wfd) = pipe_pair();
    let reactor = Reactor::current_thread();

    let drained = Rc::new(Cell::new(0usize));
    let write_edges = Rc::new(Cell::new(0usize));

    {
        let drained = drained.clone();
        reactor.register(
            Interest::READ,
            rfd,
            Some(Box::new(move || {
                // edge-triggered: drain until the kernel reports EAGAIN
                let mut buf = [0u8; 256];
                loop {
                    let n = unsafe {
                        libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n > 0 {
                        drained.set(drained.get() + n as usize);
                    } else {
                        break;
                    }
                }
            })),
            None,
            None,
            None,
        );
    }
    {
        let write_edges = write_edges.clone();
        reactor.register(
            Interest::WRITE,
            wfd,
            None,
            Some(Box::new(move || write_edges.set(write_edges.get() + 1))),
            None,
            None,
        );
    }

    let writer = std::thread::spawn(move || {
        for _ in 0..500 {
            let byte = [0x42u8];
            let n = unsafe { libc::write(wfd, byte.as_ptr() as *const libc::c_void, 1) };
            assert_eq!(n, 1);
            std::thread::sleep(Duration::from_micros(100));
        }
    });

    let r = reactor.clone();
    reactor.add_timer(1500, Some(Box::new(move || r.stop())), None, 1);
    reactor.event_loop();
    writer.join().unwrap();

    assert_eq!(drained.get(), 500, "every written byte was drained");
    assert!(write_edges.get() >= 1, "writability edge was delivered");

    reactor.cancel(Interest::READ, rfd);
    reactor.cancel(Interest::WRITE, wfd);
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

/// In one iteration every ready descriptor's handler runs exactly once:
/// two pipes made ready before the loop starts each get a single
/// callback for the single edge.
#[test]
fn each_ready_descriptor_dispatched_once_per_iteration() {
    init_logging();
    let (rfd1, wfd1) = pipe_pair();
    let (rfd2, wfd2) = pipe_pair();
    let reactor = Reactor::current_thread();

    let hits1 = Rc::new(Cell::new(0u32));
    let hits2 = Rc::new(Cell::new(0u32));
    for (rfd, hits) in [(rfd1, hits1.clone()), (rfd2, hits2.clone())] {
        reactor.register(
            Interest::READ,
            rfd,
            Some(Box::new(move || {
                hits.set(hits.get() + 1);
                let mut buf = [0u8; 16];
                while unsafe {
                    libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0
                {}
            })),
            None,
            None,
            None,
        );
    }

    // both become ready before the first wait
    for wfd in [wfd1, wfd2] {
        let byte = [1u8];
        assert_eq!(
            unsafe { libc::write(wfd, byte.as_ptr() as *const libc::c_void, 1) },
            1
        );
    }

    let r = reactor.clone();
    reactor.add_timer(100, Some(Box::new(move || r.stop())), None, 1);
    reactor.event_loop();

    assert_eq!(hits1.get(), 1);
    assert_eq!(hits2.get(), 1);

    reactor.cancel(Interest::READ, rfd1);
    reactor.cancel(Interest::READ, rfd2);
    unsafe {
        libc::close(rfd1);
        libc::close(wfd1);
        libc::close(rfd2);
        libc::close(wfd2);
    }
}

/// A panicking ready handler is contained; the loop and later dispatches
/// survive.
#[test]
fn panicking_handler_does_not_kill_the_loop() {
    init_logging();
    let (rfd, wfd) = pipe_pair();
    let reactor = Reactor::current_thread();
    let survived = Rc::new(Cell::new(false));

    reactor.register(
        Interest::READ,
        rfd,
        Some(Box::new(move || {
            let mut buf = [0u8; 16];
            while unsafe { libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
                > 0
            {}
            panic!("handler boom");
        })),
        None,
        None,
        None,
    );

    let byte = [9u8];
    assert_eq!(
        unsafe { libc::write(wfd, byte.as_ptr() as *const libc::c_void, 1) },
        1
    );

    {
        let survived = survived.clone();
        reactor.add_timer(60, Some(Box::new(move || survived.set(true))), None, 1);
    }
    let r = reactor.clone();
    reactor.add_timer(150, Some(Box::new(move || r.stop())), None, 1);
    reactor.event_loop();

    assert!(survived.get());
    reactor.cancel(Interest::READ, rfd);
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

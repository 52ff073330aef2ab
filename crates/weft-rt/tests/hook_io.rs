//! Hooked-syscall scenarios: cooperative sleeps and socket I/O.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use weft_rt::{hook, CoState, CoroutineAttr, FdRegistry, Interest, Reactor, Scheduler};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn socket_pair() -> (RawFd, RawFd) {
    let mut sv = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) },
        0
    );
    (sv[0], sv[1])
}

/// Adopt a descriptor into the runtime: non-blocking plus registry
/// metadata, the way the net layer does for its streams.
fn adopt(fd: RawFd) {
    let ctx = FdRegistry::get(fd, true).expect("descriptor metadata");
    ctx.set_nonblock(true);
}

fn stop_after(reactor: &Rc<Reactor>, ms: u64) {
    let r = reactor.clone();
    reactor.add_timer(ms, Some(Box::new(move || r.stop())), None, 1);
}

/// Two coroutines sleeping 400 ms and 600 ms overlap on one worker: the
/// wall time tracks the longer sleep, not the sum.
#[test]
fn hooked_sleeps_overlap() {
    init_logging();
    assert!(hook::enabled());
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let done = Rc::new(Cell::new(0u32));

    let spawn_sleeper = |usec: u32| {
        let done = done.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            assert_eq!(hook::usleep(usec), 0);
            done.set(done.get() + 1);
        })
    };
    let a = spawn_sleeper(400_000);
    let b = spawn_sleeper(600_000);

    let t0 = Instant::now();
    a.resume();
    b.resume();
    stop_after(&reactor, 900);
    reactor.event_loop();
    let elapsed = t0.elapsed().as_millis() as u64;

    assert_eq!(done.get(), 2);
    assert_eq!(a.state(), CoState::Terminated);
    assert_eq!(b.state(), CoState::Terminated);
    // serialized sleeps would need a full second; the stop timer at 900 ms
    // would then have cut the second sleeper off and left done at 1
    assert!(elapsed >= 600, "finished too early: {elapsed} ms");
}

/// `sleep(k)` from a coroutine comes back within
/// `[k * 1000, k * 1000 + 2 * WHEEL_CAP_MS]` of reactor time.
#[test]
fn hooked_sleep_bounds() {
    init_logging();
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let woke_at = Rc::new(Cell::new(0u64));

    let co = {
        let woke_at = woke_at.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            assert_eq!(hook::sleep(1), 0);
            woke_at.set(weft_rt::now_ms());
        })
    };
    let t0 = weft_rt::now_ms();
    co.resume();
    stop_after(&reactor, 1000 + 2 * weft_rt::WHEEL_CAP_MS);
    reactor.event_loop();

    let slept = woke_at.get().saturating_sub(t0);
    assert!(woke_at.get() > 0, "sleeper never woke");
    assert!(slept >= 1000, "woke early after {slept} ms");
    assert!(slept <= 1000 + 2 * weft_rt::WHEEL_CAP_MS, "woke late after {slept} ms");
}

/// A hooked `recv` parks the coroutine until the peer writes, then
/// completes with the data.
#[test]
fn hooked_recv_suspends_until_data() {
    init_logging();
    let (ours, theirs) = socket_pair();
    adopt(ours);
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let got = Rc::new(Cell::new(0isize));

    let co = {
        let got = got.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            let mut buf = [0u8; 32];
            let n = unsafe {
                hook::recv(ours, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            got.set(n);
            if n > 0 {
                assert_eq!(&buf[..n as usize], b"ping");
            }
        })
    };
    co.resume();
    // no data yet: the coroutine is parked behind READ interest
    assert_eq!(co.state(), CoState::Ready);
    assert_eq!(got.get(), 0);

    // peer data arrives from another thread
    let writer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let n = unsafe {
            libc::send(theirs, b"ping".as_ptr() as *const libc::c_void, 4, 0)
        };
        assert_eq!(n, 4);
    });

    stop_after(&reactor, 500);
    reactor.event_loop();
    writer.join().unwrap();

    assert_eq!(co.state(), CoState::Terminated);
    assert_eq!(got.get(), 4);

    unsafe {
        hook::close(ours);
        libc::close(theirs);
    }
}

/// The interception is transparent: a plain `libc::recv`, with no hook
/// import anywhere near it, resolves to the interposed symbol and parks
/// the calling coroutine cooperatively.
#[test]
fn plain_libc_calls_are_intercepted() {
    init_logging();
    let (ours, theirs) = socket_pair();
    adopt(ours);
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let got = Rc::new(Cell::new(0isize));

    let co = {
        let got = got.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            let mut buf = [0u8; 32];
            // ordinary-looking sequential code, no hook module in sight
            let n = unsafe {
                libc::recv(ours, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            got.set(n);
            if n > 0 {
                assert_eq!(&buf[..n as usize], b"quiet");
            }
        })
    };
    co.resume();
    // EAGAIN became a cooperative wait, not an error return
    assert_eq!(co.state(), CoState::Ready);
    assert_eq!(got.get(), 0);

    let writer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let n = unsafe {
            libc::send(theirs, b"quiet".as_ptr() as *const libc::c_void, 5, 0)
        };
        assert_eq!(n, 5);
    });

    stop_after(&reactor, 500);
    reactor.event_loop();
    writer.join().unwrap();

    assert_eq!(co.state(), CoState::Terminated);
    assert_eq!(got.get(), 5);

    unsafe {
        libc::close(ours);
        libc::close(theirs);
    }
}

/// Cooperative echo across a socketpair: one coroutine serves, driven
/// entirely by hooked calls, while a plain thread plays the client.
#[test]
fn hooked_echo_round_trip() {
    init_logging();
    let (server_fd, client_fd) = socket_pair();
    adopt(server_fd);
    let sched = Scheduler::current_thread();
    let reactor = Reactor::current_thread();
    let served = Rc::new(Cell::new(0usize));

    let server = {
        let served = served.clone();
        sched.spawn(&CoroutineAttr::default(), move || {
            let mut buf = [0u8; 64];
            loop {
                let n = unsafe {
                    hook::recv(server_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                if n <= 0 {
                    break;
                }
                let mut sent = 0usize;
                while sent < n as usize {
                    let m = unsafe {
                        hook::send(
                            server_fd,
                            buf[sent..].as_ptr() as *const libc::c_void,
                            n as usize - sent,
                            0,
                        )
                    };
                    assert!(m > 0);
                    sent += m as usize;
                }
                served.set(served.get() + sent);
            }
        })
    };
    server.resume();

    let client = std::thread::spawn(move || {
        for chunk in [b"alpha".as_slice(), b"beta", b"gamma"] {
            let n = unsafe {
                libc::send(client_fd, chunk.as_ptr() as *const libc::c_void, chunk.len(), 0)
            };
            assert_eq!(n as usize, chunk.len());
            let mut echo = vec![0u8; chunk.len()];
            let mut read = 0usize;
            while read < chunk.len() {
                let m = unsafe {
                    libc::recv(
                        client_fd,
                        echo[read..].as_mut_ptr() as *mut libc::c_void,
                        chunk.len() - read,
                        0,
                    )
                };
                assert!(m > 0);
                read += m as usize;
            }
            assert_eq!(&echo, chunk);
        }
        unsafe { libc::shutdown(client_fd, libc::SHUT_WR) };
    });

    stop_after(&reactor, 1000);
    reactor.event_loop();
    client.join().unwrap();

    assert_eq!(server.state(), CoState::Terminated);
    assert_eq!(served.get(), 14);

    reactor.cancel(Interest::READ | Interest::WRITE, server_fd);
    unsafe {
        hook::close(server_fd);
        libc::close(client_fd);
    }
}

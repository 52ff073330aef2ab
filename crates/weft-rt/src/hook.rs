//! Blocking-syscall interception by symbol interposition.
//!
//! Thirteen calls are intercepted: `sleep`, `usleep`, `read`, `readv`,
//! `recv`, `recvfrom`, `recvmsg`, `write`, `writev`, `send`, `sendto`,
//! `sendmsg` and `close`. Each is defined here as an unmangled
//! `extern "C"` function with the libc signature, so the linker resolves
//! the symbol to this module for the whole process: ordinary sequential
//! code (including `std::net` I/O) lands in these definitions without
//! importing anything. When hooking is enabled and the descriptor is a
//! non-blocking socket or FIFO, a would-block result from a coroutine
//! turns into "register readiness interest with the current coroutine as
//! resume target, yield, retry". Everything else delegates to the real
//! call, with return values and `errno` conventions untouched. The
//! bootstrap coroutine cannot suspend, so from it a would-block result is
//! returned to the caller exactly as the underlying call produced it.
//!
//! The underlying symbols are resolved through `dlsym(RTLD_NEXT)` exactly
//! once and cached for the life of the process; all internal delegation
//! goes through that table, never through the interposed names. The
//! enabled flag is process-wide; everything else the hooks touch
//! (scheduler, reactor, FD registry) is thread-local.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use libc::{
    c_char, c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    useconds_t,
};

use crate::fd::FdRegistry;
use crate::reactor::{Interest, Reactor};
use crate::scheduler::Scheduler;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Globally enable or disable interception. Defaults to on.
pub fn set_enabled(on: bool) {
    ENABLED.store(on, Ordering::Relaxed);
}

/// Whether interception is currently enabled.
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Resolved underlying functions
// ---------------------------------------------------------------------------

#[allow(clippy::type_complexity)]
struct RealFns {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    usleep: unsafe extern "C" fn(useconds_t) -> c_int,
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut sockaddr,
        *mut socklen_t,
    ) -> ssize_t,
    recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const sockaddr,
        socklen_t,
    ) -> ssize_t,
    sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t,
    close: unsafe extern "C" fn(c_int) -> c_int,
}

macro_rules! resolve {
    ($name:literal) => {{
        let sym = libc::dlsym(
            libc::RTLD_NEXT,
            concat!($name, "\0").as_ptr() as *const c_char,
        );
        assert!(!sym.is_null(), concat!("dlsym(RTLD_NEXT) found no ", $name));
        mem::transmute(sym)
    }};
}

fn real() -> &'static RealFns {
    static REAL: OnceLock<RealFns> = OnceLock::new();
    REAL.get_or_init(|| unsafe {
        RealFns {
            sleep: resolve!("sleep"),
            usleep: resolve!("usleep"),
            read: resolve!("read"),
            readv: resolve!("readv"),
            recv: resolve!("recv"),
            recvfrom: resolve!("recvfrom"),
            recvmsg: resolve!("recvmsg"),
            write: resolve!("write"),
            writev: resolve!("writev"),
            send: resolve!("send"),
            sendto: resolve!("sendto"),
            sendmsg: resolve!("sendmsg"),
            close: resolve!("close"),
        }
    })
}

fn errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Resolve the underlying symbol table. Called when a worker's scheduler
/// or reactor comes up, so resolution happens once, early, and this
/// object file (with its interposing definitions) is always part of the
/// link of anything that uses the runtime.
pub(crate) fn initialize() {
    let _ = real();
}

// ---------------------------------------------------------------------------
// Core retry loop
// ---------------------------------------------------------------------------

/// Shared interception policy for the I/O family.
///
/// Delegates outright unless hooking is on and the descriptor is a
/// non-blocking socket or FIFO. Otherwise: invoke, retry once on `EINTR`,
/// and on a would-block result park the current coroutine behind the
/// matching readiness interest and try again after it is woken. The
/// bootstrap coroutine cannot suspend, so at depth 1 a would-block result
/// is handed back unchanged; a cooperative wait is the only thing this
/// layer adds, never a change to non-blocking semantics.
fn do_io<F>(fd: c_int, interest: Interest, mut call: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !enabled() {
        return call();
    }
    let Some(ctx) = FdRegistry::get(fd, true) else {
        return call();
    };
    if ctx.is_closed() || (!ctx.is_socket() && !ctx.is_fifo()) || !ctx.is_nonblock() {
        return call();
    }
    loop {
        let mut n = call();
        if n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n == -1 && (errno() == libc::EAGAIN || errno() == libc::EWOULDBLOCK) {
            let sched = Scheduler::current_thread();
            if sched.depth() < 2 {
                return n;
            }
            let reactor = Reactor::current_thread();
            let current = sched.current();
            let (read_co, write_co) = if interest.contains(Interest::READ) {
                (Some(&current), None)
            } else {
                (None, Some(&current))
            };
            reactor.register(interest, fd, None, None, read_co, write_co);
            sched.yield_now();
            // the wait is one-shot; drop it so a later readiness edge
            // cannot resume this coroutine mid-unrelated-suspension
            reactor.cancel(interest, fd);
            continue;
        }
        return n;
    }
}

// ---------------------------------------------------------------------------
// Intercepted calls
// ---------------------------------------------------------------------------

/// POSIX `sleep(3)`. With hooking on and a suspendable caller, parks a
/// one-shot timer on this worker's reactor and yields; resumed by the
/// event loop once the timer fires. Returns 0.
#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !enabled() {
        return unsafe { (real().sleep)(seconds) };
    }
    let sched = Scheduler::current_thread();
    if sched.depth() < 2 {
        // the bootstrap coroutine cannot wait on the reactor it drives
        return unsafe { (real().sleep)(seconds) };
    }
    Reactor::current_thread().add_timer(u64::from(seconds) * 1000, None, Some(&sched.current()), 1);
    sched.yield_now();
    0
}

/// POSIX `usleep(3)`, at the reactor's millisecond granularity.
#[no_mangle]
pub extern "C" fn usleep(usec: useconds_t) -> c_int {
    if !enabled() {
        return unsafe { (real().usleep)(usec) };
    }
    let sched = Scheduler::current_thread();
    if sched.depth() < 2 {
        return unsafe { (real().usleep)(usec) };
    }
    Reactor::current_thread().add_timer(u64::from(usec) / 1000, None, Some(&sched.current()), 1);
    sched.yield_now();
    0
}

/// POSIX `read(2)`.
///
/// # Safety
/// `buf` must be valid for writes of `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, Interest::READ, || (real().read)(fd, buf, count))
}

/// POSIX `readv(2)`.
///
/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Interest::READ, || (real().readv)(fd, iov, iovcnt))
}

/// POSIX `recv(2)`.
///
/// # Safety
/// `buf` must be valid for writes of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, Interest::READ, || {
        (real().recv)(sockfd, buf, len, flags)
    })
}

/// POSIX `recvfrom(2)`.
///
/// # Safety
/// `buf`, `src_addr` and `addrlen` must be valid per the POSIX contract.
#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, Interest::READ, || {
        (real().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// POSIX `recvmsg(2)`.
///
/// # Safety
/// `msg` must point to a valid message header.
#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, Interest::READ, || {
        (real().recvmsg)(sockfd, msg, flags)
    })
}

/// POSIX `write(2)`.
///
/// # Safety
/// `buf` must be valid for reads of `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, Interest::WRITE, || (real().write)(fd, buf, count))
}

/// POSIX `writev(2)`.
///
/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Interest::WRITE, || (real().writev)(fd, iov, iovcnt))
}

/// POSIX `send(2)`.
///
/// # Safety
/// `buf` must be valid for reads of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, Interest::WRITE, || {
        (real().send)(sockfd, buf, len, flags)
    })
}

/// POSIX `sendto(2)`.
///
/// # Safety
/// `buf` and `dest_addr` must be valid per the POSIX contract.
#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, Interest::WRITE, || {
        (real().sendto)(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

/// POSIX `sendmsg(2)`.
///
/// # Safety
/// `msg` must point to a valid message header.
#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, Interest::WRITE, || {
        (real().sendmsg)(sockfd, msg, flags)
    })
}

/// POSIX `close(2)`. With hooking on, pending reactor interests on the
/// descriptor are cancelled (a coroutine waiting there is dropped
/// silently, never resumed) and the registry entry removed before the
/// real close. A cancel failure is suppressed; close always proceeds.
///
/// # Safety
/// `fd` must not be owned by a type that will close it again.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !enabled() {
        return (real().close)(fd);
    }
    if FdRegistry::get(fd, false).is_some() {
        let reactor = Reactor::current_thread();
        reactor.cancel(Interest::READ, fd);
        reactor.cancel(Interest::WRITE, fd);
        FdRegistry::remove(fd);
    }
    (real().close)(fd)
}

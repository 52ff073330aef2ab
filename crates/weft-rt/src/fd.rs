//! Per-thread file-descriptor metadata.
//!
//! The hook layer needs to know, per descriptor, whether cooperative
//! interception applies: only non-blocking sockets and FIFOs are turned
//! into register-and-yield waits. That classification is probed from the
//! kernel once, when the descriptor is first seen, and cached in a
//! thread-local table. Receive/send timeouts live here too for
//! higher-level wrappers to consult; the core reactor never auto-expires
//! an I/O wait.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use log::warn;
use rustc_hash::FxHashMap;

/// Sentinel meaning "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Set `O_NONBLOCK` on `fd` if not already set.
pub(crate) fn set_nonblock_raw(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FdContext
// ---------------------------------------------------------------------------

/// Cached kernel-side facts and runtime settings for one descriptor.
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    is_fifo: bool,
    is_closed: bool,
    nonblock: Cell<bool>,
    recv_timeout: Cell<u64>,
    send_timeout: Cell<u64>,
}

impl FdContext {
    /// Probe the kernel for the descriptor's file type and cache whether
    /// its non-blocking flag is set. The probe never changes the flag:
    /// with the hooks interposed process-wide, a descriptor some ordinary
    /// blocking caller owns must stay blocking. The reactor (and anything
    /// adopting a descriptor into the runtime) flips the flag explicitly.
    fn probe(fd: RawFd) -> FdContext {
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        let mut is_socket = false;
        let mut is_fifo = false;
        let mut is_closed = false;
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            is_closed = io::Error::last_os_error().raw_os_error() == Some(libc::EBADF);
        } else {
            let fmt = stat.st_mode & libc::S_IFMT;
            is_socket = fmt == libc::S_IFSOCK;
            is_fifo = fmt == libc::S_IFIFO;
        }
        let mut nonblock = false;
        if !is_closed {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            nonblock = flags != -1 && flags & libc::O_NONBLOCK != 0;
        }
        FdContext {
            fd,
            is_socket,
            is_fifo,
            is_closed,
            nonblock: Cell::new(nonblock),
            recv_timeout: Cell::new(NO_TIMEOUT),
            send_timeout: Cell::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_fifo(&self) -> bool {
        self.is_fifo
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Whether the descriptor is in non-blocking mode. A descriptor put
    /// back into user-blocking mode is left alone by the hook layer.
    pub fn is_nonblock(&self) -> bool {
        self.nonblock.get()
    }

    /// Flip the kernel `O_NONBLOCK` flag and remember the mode.
    pub fn set_nonblock(&self, on: bool) {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            warn!("fcntl(F_GETFL) on fd {} failed", self.fd);
            return;
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } == -1 {
            warn!("fcntl(F_SETFL) on fd {} failed", self.fd);
            return;
        }
        self.nonblock.set(on);
    }

    /// Stored timeout in milliseconds; [`NO_TIMEOUT`] when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.get(),
            TimeoutKind::Send => self.send_timeout.get(),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.set(ms),
            TimeoutKind::Send => self.send_timeout.set(ms),
        }
    }
}

// ---------------------------------------------------------------------------
// FdRegistry
// ---------------------------------------------------------------------------

thread_local! {
    static FD_TABLE: RefCell<FxHashMap<RawFd, Rc<FdContext>>> =
        RefCell::new(FxHashMap::default());
}

/// Facade over this thread's descriptor table.
pub struct FdRegistry;

impl FdRegistry {
    /// Look up metadata for `fd`, probing and caching it when
    /// `auto_create` is set. Negative descriptors yield `None`, as does
    /// any lookup after this thread's table has been torn down (the
    /// interposed `close` runs inside thread-local destructors too).
    pub fn get(fd: RawFd, auto_create: bool) -> Option<Rc<FdContext>> {
        if fd < 0 {
            return None;
        }
        FD_TABLE
            .try_with(|table| {
                let mut table = table.borrow_mut();
                if let Some(ctx) = table.get(&fd) {
                    return Some(ctx.clone());
                }
                if !auto_create {
                    return None;
                }
                let ctx = Rc::new(FdContext::probe(fd));
                table.insert(fd, ctx.clone());
                Some(ctx)
            })
            .ok()
            .flatten()
    }

    /// Forget a descriptor, typically on close.
    pub fn remove(fd: RawFd) {
        let _ = FD_TABLE.try_with(|table| {
            table.borrow_mut().remove(&fd);
        });
    }

    /// Refresh the cached non-blocking flag after someone flipped it on
    /// at the kernel level (the reactor does this on registration). A
    /// descriptor without an entry is left alone; its eventual probe
    /// reads the flag from the kernel anyway.
    pub(crate) fn note_nonblock(fd: RawFd) {
        let _ = FD_TABLE.try_with(|table| {
            if let Some(ctx) = table.borrow().get(&fd) {
                ctx.nonblock.set(true);
            }
        });
    }

    /// Drop every cached entry on this thread.
    pub fn clear() {
        let _ = FD_TABLE.try_with(|table| table.borrow_mut().clear());
    }
}

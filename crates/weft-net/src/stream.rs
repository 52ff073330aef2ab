//! Cooperative TCP stream.
//!
//! A thin adoption wrapper around `std::net::TcpStream`: the socket is
//! switched to non-blocking and its metadata probed into the runtime's FD
//! registry, and from then on the stream is used through the ordinary
//! std `Read`/`Write` impls. No special I/O calls are involved; `read`,
//! `recv`, `send`, `write` and `close` are interposed process-wide by the
//! runtime's hook layer, so a would-block inside a coroutine suspends
//! that coroutine and dropping the stream (which closes the descriptor)
//! tears down any reactor interest and registry metadata along the way.
//!
//! Outside a coroutine the hooks cannot suspend, so the non-blocking
//! socket behaves like any non-blocking socket: handler code belongs in
//! coroutines.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use log::warn;

use weft_rt::{FdRegistry, TimeoutKind, NO_TIMEOUT};

/// A connected TCP stream adopted into this worker's runtime.
pub struct CoTcpStream {
    inner: TcpStream,
}

impl CoTcpStream {
    /// Adopt a connected std stream: flip it non-blocking and record its
    /// metadata so the interposed syscalls treat it cooperatively.
    pub fn from_std(stream: TcpStream) -> CoTcpStream {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("could not set stream non-blocking: {e}");
        }
        FdRegistry::get(stream.as_raw_fd(), true);
        CoTcpStream { inner: stream }
    }

    /// Connect to `addr` (a plain blocking connect) and adopt the result.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoTcpStream> {
        Ok(CoTcpStream::from_std(TcpStream::connect(addr)?))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Store a receive timeout in the FD registry for wrappers that
    /// enforce deadlines. The core runtime does not expire waits itself.
    pub fn set_recv_timeout(&self, ms: u64) {
        if let Some(ctx) = FdRegistry::get(self.as_raw_fd(), true) {
            ctx.set_timeout(TimeoutKind::Recv, ms);
        }
    }

    pub fn recv_timeout(&self) -> u64 {
        FdRegistry::get(self.as_raw_fd(), true)
            .map(|ctx| ctx.timeout(TimeoutKind::Recv))
            .unwrap_or(NO_TIMEOUT)
    }

    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            warn!("shutdown failed: {e}");
        }
    }
}

impl Read for CoTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for CoTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl Read for &CoTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for &CoTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl std::fmt::Debug for CoTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoTcpStream")
            .field("fd", &self.as_raw_fd())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

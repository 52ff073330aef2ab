//! Coroutine-per-connection TCP server framework.
//!
//! A [`TcpServer`] binds one or more listeners, then runs each accept
//! loop in its own coroutine: accept until `WouldBlock`, park behind READ
//! interest, retry when the reactor wakes it. Every accepted connection
//! gets a fresh coroutine running the user handler over a
//! [`CoTcpStream`]. The server owns the coroutines it spawns (the reactor
//! only holds weak resume references) and prunes terminated connection
//! handles as it accepts.
//!
//! Everything runs on the calling worker; drive
//! `Reactor::current_thread().event_loop()` after `start`.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use log::{info, warn};

use weft_rt::{
    CoState, Coroutine, CoroutineAttr, FdRegistry, Interest, Reactor, Scheduler, TimeoutKind,
};

use crate::stream::CoTcpStream;

/// Connection handler invoked in a dedicated coroutine per connection.
pub type ConnHandler = Rc<dyn Fn(CoTcpStream)>;

/// A cooperative TCP server.
pub struct TcpServer {
    name: String,
    pending: RefCell<Vec<TcpListener>>,
    addrs: RefCell<Vec<SocketAddr>>,
    listener_fds: RefCell<Vec<RawFd>>,
    accept_cos: RefCell<Vec<Rc<Coroutine>>>,
    conns: RefCell<Vec<Rc<Coroutine>>>,
    recv_timeout_ms: Cell<u64>,
    stopped: Cell<bool>,
}

impl TcpServer {
    pub fn new(name: &str) -> Rc<TcpServer> {
        Rc::new(TcpServer {
            name: name.to_owned(),
            pending: RefCell::new(Vec::new()),
            addrs: RefCell::new(Vec::new()),
            listener_fds: RefCell::new(Vec::new()),
            accept_cos: RefCell::new(Vec::new()),
            conns: RefCell::new(Vec::new()),
            recv_timeout_ms: Cell::new(1000),
            stopped: Cell::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive timeout recorded on every accepted connection's registry
    /// entry, for handlers that enforce deadlines.
    pub fn set_recv_timeout(&self, ms: u64) {
        self.recv_timeout_ms.set(ms);
    }

    /// Bind and listen on `addr`. Failures are logged and reported as
    /// `false`; a server may bind several addresses before starting.
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> bool {
        match TcpListener::bind(addr) {
            Ok(listener) => {
                if let Err(e) = listener.set_nonblocking(true) {
                    warn!("{}: could not set listener non-blocking: {e}", self.name);
                    return false;
                }
                match listener.local_addr() {
                    Ok(local) => {
                        info!("{}: listening on {local}", self.name);
                        self.addrs.borrow_mut().push(local);
                    }
                    Err(e) => warn!("{}: local_addr failed: {e}", self.name),
                }
                self.pending.borrow_mut().push(listener);
                true
            }
            Err(e) => {
                warn!("{}: bind failed: {e}", self.name);
                false
            }
        }
    }

    /// Addresses bound so far.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.addrs.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Spawn one accept coroutine per bound listener. Idempotent while
    /// running.
    pub fn start<F>(self: &Rc<Self>, handler: F)
    where
        F: Fn(CoTcpStream) + 'static,
    {
        if !self.stopped.get() {
            return;
        }
        self.stopped.set(false);
        let handler: ConnHandler = Rc::new(handler);
        let sched = Scheduler::current_thread();
        for listener in self.pending.borrow_mut().drain(..) {
            self.listener_fds.borrow_mut().push(listener.as_raw_fd());
            let server = self.clone();
            let handler = handler.clone();
            let co = sched.spawn(&CoroutineAttr::default(), move || {
                server.accept_loop(listener, handler);
            });
            self.accept_cos.borrow_mut().push(co.clone());
            co.resume();
        }
    }

    /// Stop accepting: cancel the listener waits and nudge each accept
    /// coroutine awake so it can observe the flag and unwind, closing its
    /// listener.
    pub fn stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        let reactor = Reactor::current_thread();
        for fd in self.listener_fds.borrow_mut().drain(..) {
            reactor.cancel(Interest::READ, fd);
        }
        for co in self.accept_cos.borrow_mut().drain(..) {
            if co.state() != CoState::Terminated {
                reactor.add_timer(0, None, Some(&co), 1);
            }
        }
        info!("{}: stopping", self.name);
    }

    fn accept_loop(self: Rc<Self>, listener: TcpListener, handler: ConnHandler) {
        let fd = listener.as_raw_fd();
        let sched = Scheduler::current_thread();
        let reactor = Reactor::current_thread();
        while !self.stopped.get() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!("{}: accepted {peer}", self.name);
                    let conn = CoTcpStream::from_std(stream);
                    if let Some(ctx) = FdRegistry::get(conn.as_raw_fd(), true) {
                        ctx.set_timeout(TimeoutKind::Recv, self.recv_timeout_ms.get());
                    }
                    let handler = handler.clone();
                    let co = sched.spawn(&CoroutineAttr::default(), move || handler(conn));
                    self.retain_conn(co.clone());
                    co.resume();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    reactor.register(
                        Interest::READ,
                        fd,
                        None,
                        None,
                        Some(&sched.current()),
                        None,
                    );
                    sched.yield_now();
                    reactor.cancel(Interest::READ, fd);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("{}: accept failed: {e}", self.name);
                }
            }
        }
        // listener drops here, closing the descriptor
    }

    /// Keep the connection coroutine alive while it is suspended in I/O
    /// waits, dropping finished ones as new connections arrive.
    fn retain_conn(&self, co: Rc<Coroutine>) {
        let mut conns = self.conns.borrow_mut();
        conns.retain(|c| c.state() != CoState::Terminated);
        conns.push(co);
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("addrs", &*self.addrs.borrow())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

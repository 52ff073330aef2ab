//! Networking adapters for the weft runtime.
//!
//! Sequential-looking servers over cooperative coroutines:
//!
//! - [`stream::CoTcpStream`]: a TCP stream whose `Read`/`Write` impls go
//!   through the runtime's syscall hooks, so handler code suspends its
//!   coroutine instead of blocking the worker thread
//! - [`tcp::TcpServer`]: accept loop in a coroutine, one coroutine per
//!   connection
//! - [`http`]: a minimal HTTP/1.x server with an exact-path router
//!
//! All of it runs on one worker: spawn the servers, then drive
//! `Reactor::event_loop()` from the thread's bootstrap coroutine.

pub mod http;
pub mod stream;
pub mod tcp;

pub use http::{HttpRequest, HttpResponse, HttpServer, Method, Router};
pub use stream::CoTcpStream;
pub use tcp::TcpServer;

//! Minimal HTTP/1.x support over the TCP framework.
//!
//! Request parsing and response formatting ([`message`]), an exact-path
//! router, and a server that reads requests from a connection coroutine
//! sequentially, honoring HTTP/1.1 keep-alive.

pub mod message;
pub mod server;

pub use message::{HttpRequest, HttpResponse, Method};
pub use server::{HttpServer, Router};

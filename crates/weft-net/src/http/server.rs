//! HTTP/1.x server and router over [`TcpServer`].

use std::io::BufReader;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::http::message::{HttpRequest, HttpResponse, Method};
use crate::stream::CoTcpStream;
use crate::tcp::TcpServer;

/// Route handler: borrow the request, produce a response.
pub type HttpHandler = Rc<dyn Fn(&HttpRequest) -> HttpResponse>;

/// Exact-path router with a default handler for everything unmatched.
pub struct Router {
    routes: FxHashMap<(Method, String), HttpHandler>,
    default: HttpHandler,
}

impl Router {
    pub fn new() -> Router {
        Router {
            routes: FxHashMap::default(),
            default: Rc::new(|_| HttpResponse::with_body(404, "not found\n")),
        }
    }

    /// Install a handler for an exact method/path pair, replacing any
    /// previous one.
    pub fn route<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + 'static,
    {
        self.routes.insert((method, path.to_owned()), Rc::new(handler));
        self
    }

    /// Replace the fallback handler.
    pub fn default_route<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + 'static,
    {
        self.default = Rc::new(handler);
        self
    }

    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        match self.routes.get(&(request.method, request.path.clone())) {
            Some(handler) => handler(request),
            None => (self.default)(request),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

/// An HTTP server: a router behind a coroutine-per-connection TCP server.
pub struct HttpServer {
    tcp: Rc<TcpServer>,
    router: Rc<Router>,
}

impl HttpServer {
    pub fn new(name: &str, router: Router) -> Rc<HttpServer> {
        Rc::new(HttpServer {
            tcp: TcpServer::new(name),
            router: Rc::new(router),
        })
    }

    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> bool {
        self.tcp.bind(addr)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.tcp.local_addrs()
    }

    /// Start serving. Each connection coroutine reads requests
    /// sequentially and keeps the connection open per HTTP/1.1 keep-alive
    /// rules.
    pub fn start(self: &Rc<Self>) {
        let router = self.router.clone();
        self.tcp.start(move |stream| serve_connection(&router, stream));
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

fn serve_connection(router: &Router, stream: CoTcpStream) {
    let mut reader = BufReader::new(&stream);
    loop {
        let request = match HttpRequest::parse(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!("dropping connection after parse error: {e}");
                let _ = HttpResponse::with_body(400, "bad request\n").write_to(&mut &stream);
                break;
            }
        };
        let keep_alive = request.keep_alive();
        let mut response = router.dispatch(&request);
        response.set_header(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );
        if let Err(e) = response.write_to(&mut &stream) {
            warn!("could not write response: {e}");
            break;
        }
        if !keep_alive {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_dispatches_exact_and_default() {
        let mut router = Router::new();
        router.route(Method::Get, "/ping", |_| HttpResponse::with_body(200, "pong"));

        let raw = "GET /ping HTTP/1.1\r\n\r\n";
        let mut reader = std::io::BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(router.dispatch(&req).status, 200);

        let raw = "GET /missing HTTP/1.1\r\n\r\n";
        let mut reader = std::io::BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(router.dispatch(&req).status, 404);
    }

    #[test]
    fn route_replacement_wins() {
        let mut router = Router::new();
        router.route(Method::Get, "/", |_| HttpResponse::new(500));
        router.route(Method::Get, "/", |_| HttpResponse::new(204));

        let raw = "GET / HTTP/1.1\r\n\r\n";
        let mut reader = std::io::BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(router.dispatch(&req).status, 204);
    }
}

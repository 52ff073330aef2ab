//! End-to-end HTTP requests against the cooperative server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use weft_net::{HttpResponse, HttpServer, Method, Router};
use weft_rt::Reactor;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stop_after(reactor: &Rc<Reactor>, ms: u64) {
    let r = reactor.clone();
    reactor.add_timer(ms, Some(Box::new(move || r.stop())), None, 1);
}

fn read_response(conn: &mut TcpStream) -> String {
    // responses here are small; read until the body announced by
    // Content-Length is complete
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = conn.read(&mut buf).expect("read response");
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let length = text
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if raw.len() >= head_end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8(raw).expect("utf-8 response")
}

#[test]
fn routes_and_keep_alive() {
    init_logging();
    let mut router = Router::new();
    router.route(Method::Get, "/ping", |_| {
        HttpResponse::with_body(200, "pong\n")
    });
    router.route(Method::Post, "/echo", |req| {
        HttpResponse::with_body(200, req.body.clone())
    });

    let server = HttpServer::new("http-test", router);
    assert!(server.bind("127.0.0.1:0"));
    let addr = server.local_addrs()[0];
    server.start();

    let client = std::thread::spawn(move || {
        let mut conn = TcpStream::connect(addr).expect("connect");
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        // two requests over one keep-alive connection
        conn.write_all(b"GET /ping HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let resp = read_response(&mut conn);
        assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {resp}");
        assert!(resp.ends_with("pong\n"));

        conn.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nwefts")
            .unwrap();
        let resp = read_response(&mut conn);
        assert!(resp.ends_with("wefts"), "got: {resp}");

        // unmatched path falls through to the 404 default
        conn.write_all(b"GET /nope HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let resp = read_response(&mut conn);
        assert!(resp.starts_with("HTTP/1.1 404"), "got: {resp}");
    });

    let reactor = Reactor::current_thread();
    stop_after(&reactor, 1500);
    reactor.event_loop();
    client.join().unwrap();
    server.stop();
}

//! TCP echo server on one cooperative worker.
//!
//! ```text
//! cargo run --example echo
//! printf 'hello\n' | nc 127.0.0.1 8900
//! ```

use std::io::{Read, Write};

use weft_net::TcpServer;
use weft_rt::Reactor;

fn main() {
    env_logger::init();

    let server = TcpServer::new("echo");
    if !server.bind("127.0.0.1:8900") {
        eprintln!("could not bind 127.0.0.1:8900");
        std::process::exit(1);
    }
    server.start(|mut stream| {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Reactor::current_thread().event_loop();
}

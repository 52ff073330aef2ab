//! HTTP/1.x request parsing and response formatting.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

/// Request methods the router understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub fn parse(s: &str) -> Option<Method> {
        Some(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub minor_version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of a header, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the connection should stay open after this request.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.minor_version >= 1,
        }
    }

    /// Read one request off `reader`. `Ok(None)` means the peer closed
    /// the connection cleanly before a request line arrived.
    pub fn parse<R: BufRead>(reader: &mut R) -> io::Result<Option<HttpRequest>> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let mut parts = line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return Err(invalid("malformed request line")),
        };
        let method = Method::parse(method).ok_or_else(|| invalid("unknown method"))?;
        let minor_version = match version {
            "HTTP/1.0" => 0,
            "HTTP/1.1" => 1,
            _ => return Err(invalid("unsupported protocol version")),
        };
        let (path, query) = match target.split_once('?') {
            Some((path, raw)) => (path.to_owned(), parse_query(raw)),
            None => (target.to_owned(), Vec::new()),
        };

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(invalid("connection closed inside header block"));
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| invalid("malformed header line"))?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse::<usize>())
            .transpose()
            .map_err(|_| invalid("unparseable content-length"))?
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;

        Ok(Some(HttpRequest {
            method,
            path,
            query,
            minor_version,
            headers,
            body,
        }))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// A response under construction.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>) -> HttpResponse {
        let mut resp = HttpResponse::new(status);
        resp.body = body.into();
        resp
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Serialize as HTTP/1.1, filling in Content-Length.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write!(
            writer,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        )?;
        let mut has_length = false;
        for (name, value) in &self.headers {
            has_length |= name.eq_ignore_ascii_case("content-length");
            write!(writer, "{name}: {value}\r\n")?;
        }
        if !has_length {
            write!(writer, "Content-Length: {}\r\n", self.body.len())?;
        }
        writer.write_all(b"\r\n")?;
        writer.write_all(&self.body)?;
        writer.flush()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn parses_get_with_query_and_headers() {
        let raw = "GET /search?q=weft&page=2 HTTP/1.1\r\n\
                   Host: example.test\r\n\
                   Connection: keep-alive\r\n\
                   \r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/search");
        assert_eq!(req.query_param("q"), Some("weft"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.header("host"), Some("example.test"));
        assert_eq!(req.minor_version, 1);
        assert!(req.keep_alive());
        assert!(req.body.is_empty());
    }

    #[test]
    fn parses_post_body_by_content_length() {
        let raw = "POST /submit HTTP/1.1\r\n\
                   Content-Length: 11\r\n\
                   \r\n\
                   hello weft!";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body, b"hello weft!");
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(HttpRequest::parse(&mut reader).unwrap().is_none());
    }

    #[test]
    fn malformed_request_line_is_invalid_data() {
        let mut reader = BufReader::new(&b"NONSENSE\r\n\r\n"[..]);
        let err = HttpRequest::parse(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn http10_defaults_to_close() {
        let raw = "GET / HTTP/1.0\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert_eq!(req.minor_version, 0);
        assert!(!req.keep_alive());
    }

    #[test]
    fn connection_close_overrides_keep_alive_default() {
        let raw = "GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = HttpRequest::parse(&mut reader).unwrap().unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn response_formats_with_content_length() {
        let mut resp = HttpResponse::with_body(200, "pong");
        resp.set_header("Content-Type", "text/plain");
        let mut out = Vec::new();
        resp.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\npong"));
    }

    #[test]
    fn unknown_status_still_formats() {
        let resp = HttpResponse::new(799);
        let mut out = Vec::new();
        resp.write_to(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 799 Unknown\r\n"));
    }
}

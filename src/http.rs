//! An illustrative HTTP/1.x request/response codec.
//!
//! Not part of the reactor core: a [`crate::connection::Connection`]'s
//! message callback only ever sees raw bytes. This module shows how a
//! protocol built on top of the core might parse a request out of a
//! [`crate::buffer::Buffer`] and serialize a response back into one — it
//! is a collaborator, not a dependency of anything else in this crate.
//! Request bodies are out of scope; only the request line and headers are
//! parsed.

use std::collections::HashMap;
use std::fmt;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// A parsed request line and header block. Body parsing is out of scope.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: String,
    version: Version,
    headers: HashMap<String, String>,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    GotAll,
}

/// Incrementally parses an HTTP request out of the readable bytes of a
/// [`Buffer`], line by line, consuming each CRLF-terminated line as it is
/// recognized. A message callback owning one of these keeps it around
/// across deliveries, feeding it more of the buffer each time more bytes
/// arrive, until [`RequestParser::got_all`] returns true.
pub struct RequestParser {
    state: ParseState,
    method: Option<Method>,
    path: String,
    query: String,
    version: Option<Version>,
    headers: HashMap<String, String>,
}

impl Default for RequestParser {
    fn default() -> RequestParser {
        RequestParser {
            state: ParseState::RequestLine,
            method: None,
            path: String::new(),
            query: String::new(),
            version: None,
            headers: HashMap::new(),
        }
    }
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser::default()
    }

    pub fn got_all(&self) -> bool {
        self.state == ParseState::GotAll
    }

    /// Consumes as many complete CRLF-terminated lines as are available in
    /// `buf`, advancing internal state. Returns `false` the moment a line
    /// fails to parse (a malformed request line, most commonly); the
    /// caller should close the connection in that case. Leaves any
    /// trailing partial line in `buf` for the next call.
    pub fn parse(&mut self, buf: &mut Buffer) -> bool {
        loop {
            match self.state {
                ParseState::GotAll => return true,
                _ => {
                    let crlf = match buf.find_crlf() {
                        Some(i) => i,
                        None => return true, // need more bytes
                    };
                    let line = buf.retrieve_as_string(crlf);
                    buf.retrieve(2); // the CRLF itself
                    if !self.consume_line(&line) {
                        return false;
                    }
                }
            }
        }
    }

    fn consume_line(&mut self, line: &str) -> bool {
        match self.state {
            ParseState::RequestLine => {
                if !self.parse_request_line(line) {
                    return false;
                }
                self.state = ParseState::Headers;
                true
            }
            ParseState::Headers => {
                if line.is_empty() {
                    self.state = ParseState::GotAll;
                    return true;
                }
                match line.split_once(':') {
                    Some((name, value)) => {
                        self.headers.insert(
                            name.trim().to_ascii_lowercase(),
                            value.trim_end().trim_start().to_string(),
                        );
                        true
                    }
                    None => false,
                }
            }
            ParseState::GotAll => true,
        }
    }

    /// `METHOD SP PATH[?QUERY] SP HTTP/1.[0|1]`.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (method, rest, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(r), Some(v), None) => (m, r, v),
            _ => return false,
        };

        self.method = match Method::parse(method) {
            Some(m) => Some(m),
            None => return false,
        };

        self.version = match version {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => return false,
        };

        match rest.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = query.to_string();
            }
            None => self.path = rest.to_string(),
        }
        true
    }

    /// Consumes this parser's accumulated state into a [`Request`]. Only
    /// meaningful once [`RequestParser::got_all`] is true.
    pub fn take(self) -> Option<Request> {
        Some(Request {
            method: self.method?,
            path: self.path,
            query: self.query,
            version: self.version?,
            headers: self.headers,
        })
    }
}

fn reason_phrase(status_code: u32) -> &'static str {
    match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Whether a response should close the connection or offer keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Close,
    KeepAlive,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Close => f.write_str("close"),
            Connection::KeepAlive => f.write_str("Keep-Alive"),
        }
    }
}

/// Builds an HTTP/1.1 response and appends it to `buf`: status line,
/// either `Connection: close` or (`Content-Length` + `Connection:
/// Keep-Alive`), any extra headers, a blank line, then the body.
pub struct ResponseBuilder {
    status_code: u32,
    connection: Connection,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u32, connection: Connection) -> ResponseBuilder {
        ResponseBuilder {
            status_code,
            connection,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> ResponseBuilder {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> ResponseBuilder {
        self.body = body.into();
        self
    }

    pub fn write_to(self, buf: &mut Buffer) {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        );
        match self.connection {
            Connection::Close => head.push_str("Connection: close\r\n"),
            Connection::KeepAlive => {
                head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
                head.push_str("Connection: Keep-Alive\r\n");
            }
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        buf.append(head.as_bytes());
        buf.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_get_request_with_query_and_headers() {
        let mut buf = Buffer::new();
        buf.append(b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");

        let mut parser = RequestParser::new();
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());

        let req = parser.take().unwrap();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), "q=rust");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header("host"), Some("example.com"));
    }

    #[test]
    fn incremental_delivery_leaves_partial_line_in_buffer() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: ex");

        let mut parser = RequestParser::new();
        assert!(parser.parse(&mut buf));
        assert!(!parser.got_all());

        buf.append(b"ample.com\r\n\r\n");
        assert!(parser.parse(&mut buf));
        assert!(parser.got_all());
    }

    #[test]
    fn malformed_request_line_fails() {
        let mut buf = Buffer::new();
        buf.append(b"GARBAGE\r\n");
        let mut parser = RequestParser::new();
        assert!(!parser.parse(&mut buf));
    }

    #[test]
    fn response_builder_keep_alive_sets_content_length() {
        let mut buf = Buffer::new();
        ResponseBuilder::new(200, Connection::KeepAlive)
            .header("Server", "reactor-net")
            .body(b"hi".to_vec())
            .write_to(&mut buf);

        let rendered = buf.retrieve_all_as_bytes();
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: Keep-Alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn response_builder_close_omits_content_length() {
        let mut buf = Buffer::new();
        ResponseBuilder::new(404, Connection::Close).write_to(&mut buf);
        let text = String::from_utf8(buf.retrieve_all_as_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Content-Length"));
    }
}

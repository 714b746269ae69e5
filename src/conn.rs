// src/conn.rs
//
// Per-connection state machine. Each accepted socket owns a fixed read
// buffer with an append cursor and a parse cursor, a fixed write buffer
// for response headers (and inline error bodies), and an optional mapped
// file transmitted as the second segment of a scatter-write.
//
// Exactly one thread touches a connection at a time: the one-shot re-arm
// protocol guarantees it, so there is no per-connection lock. Ownership of
// the `Conn` box moves between the event loop and a worker through the
// connection table.

use std::net::SocketAddr;

use crate::error::EmberResult;
use crate::files::{self, FileError, MappedFile};
use crate::parser::{Method, ParseStatus, Parser};
use crate::syscalls::{self, ReadOutcome};

/// Coarse connection lifecycle, mirrored in the table for the idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Slot is unused.
    Free,
    /// Armed for read-readiness, waiting for request bytes.
    Reading,
    /// A task for this connection is queued or running; not armed.
    Processing,
    /// Response staged, armed for write-readiness.
    Writing,
    /// Worker requested teardown; the event loop will recycle the slot.
    Closing,
}

/// What one processing step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Request incomplete; more bytes must arrive first.
    NeedMoreData,
    /// A response is staged (possibly partially sent); arm for write.
    ResponseReady,
    /// Protocol error; a 400 is staged and keep-alive is forced off.
    Error,
    /// The staged response has been fully transmitted.
    Complete,
}

/// Why a processing step ran: the readiness event that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
}

/// Result of draining the socket into the read buffer.
pub enum FillOutcome {
    /// Drained to EAGAIN; `usize` is the number of new bytes.
    Drained(usize),
    /// Peer closed while we were reading.
    Eof,
}

const BODY_400: &[u8] = b"<html><body><h1>400 Bad Request</h1>\
<p>The request was malformed or names a forbidden path.</p></body></html>\n";
const BODY_404: &[u8] = b"<html><body><h1>404 Not Found</h1>\
<p>No such file under the document root.</p></body></html>\n";
const BODY_500: &[u8] = b"<html><body><h1>500 Internal Server Error</h1>\
<p>The server failed reading the requested file.</p></body></html>\n";

pub struct Conn {
    pub fd: i32,
    pub peer: Option<SocketAddr>,
    pub state: ConnState,
    /// Epoch seconds of the last event, for the idle sweep.
    pub last_active: u32,
    pub requests_served: u32,
    /// Keep-alive decision for the staged response.
    pub keep_alive: bool,

    read_buf: Box<[u8]>,
    /// Append cursor: bytes `..filled` hold drained request data.
    filled: usize,
    /// Parse cursor: bytes `..checked` have been consumed by the parser.
    checked: usize,
    parser: Parser,

    write_buf: Box<[u8]>,
    /// Bytes of `write_buf` staged (headers plus any inline body).
    header_len: usize,
    /// First segment cursor: bytes of `write_buf` already on the wire.
    header_sent: usize,
    /// Second segment: the mapped file, if the response has a file body.
    file: Option<MappedFile>,
    /// Second segment cursor.
    file_sent: usize,
}

impl Conn {
    /// Allocate a slot's connection once, at table construction. Buffers
    /// are never reallocated; `init` recycles the slot for each accept.
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            fd: -1,
            peer: None,
            state: ConnState::Free,
            last_active: 0,
            requests_served: 0,
            keep_alive: false,
            read_buf: vec![0; read_capacity].into_boxed_slice(),
            filled: 0,
            checked: 0,
            parser: Parser::new(),
            write_buf: vec![0; write_capacity].into_boxed_slice(),
            header_len: 0,
            header_sent: 0,
            file: None,
            file_sent: 0,
        }
    }

    /// Re-initialize transient state for a freshly accepted socket.
    pub fn init(&mut self, fd: i32, peer: Option<SocketAddr>, now: u32) {
        self.fd = fd;
        self.peer = peer;
        self.state = ConnState::Reading;
        self.last_active = now;
        self.requests_served = 0;
        self.keep_alive = false;
        self.filled = 0;
        self.checked = 0;
        self.parser.reset();
        self.header_len = 0;
        self.header_sent = 0;
        self.file = None;
        self.file_sent = 0;
    }

    /// Release per-connection resources and mark the slot free. The caller
    /// closes the socket; dropping the mapping unmaps it exactly once.
    pub fn clear(&mut self) {
        self.fd = -1;
        self.peer = None;
        self.state = ConnState::Free;
        self.file = None;
    }

    /// Unparsed request bytes already drained off the socket. After a
    /// keep-alive reset these must be parsed without waiting for another
    /// readiness event, because no event will ever fire for them.
    pub fn has_buffered(&self) -> bool {
        self.filled > self.checked
    }

    /// Non-blocking drain of everything the socket currently holds.
    pub fn fill(&mut self) -> EmberResult<FillOutcome> {
        let mut total = 0usize;
        loop {
            if self.filled == self.read_buf.len() {
                // No room left: the request can never fit, so the parser
                // will fail it with `TooLarge`. Discard the excess so the
                // 400 reaches the peer instead of a reset.
                let mut scratch = [0u8; 512];
                loop {
                    match syscalls::read_nonblocking(self.fd, &mut scratch)? {
                        ReadOutcome::Data(_) => continue,
                        ReadOutcome::Eof => return Ok(FillOutcome::Eof),
                        ReadOutcome::WouldBlock => return Ok(FillOutcome::Drained(total)),
                    }
                }
            }
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.filled..])? {
                ReadOutcome::Data(n) => {
                    self.filled += n;
                    total += n;
                }
                ReadOutcome::Eof => return Ok(FillOutcome::Eof),
                ReadOutcome::WouldBlock => return Ok(FillOutcome::Drained(total)),
            }
        }
    }

    /// One processing step, driven by the readiness that caused it.
    /// Performs no blocking I/O.
    pub fn process(&mut self, reason: Readiness, root: &std::path::Path) -> EmberResult<ProcessOutcome> {
        match reason {
            Readiness::Readable => Ok(self.step_parse(root)),
            Readiness::Writable => self.step_flush(),
        }
    }

    /// Consume buffered bytes; on request completion stage the response.
    fn step_parse(&mut self, root: &std::path::Path) -> ProcessOutcome {
        let capacity = self.read_buf.len();
        let buf = &self.read_buf[..self.filled];
        match self.parser.advance(buf, &mut self.checked, capacity) {
            Ok(ParseStatus::NeedMoreData) => ProcessOutcome::NeedMoreData,
            Ok(ParseStatus::Complete) => {
                self.requests_served += 1;
                self.keep_alive = self.parser.keep_alive;
                self.build_response(root);
                self.state = ConnState::Writing;
                ProcessOutcome::ResponseReady
            }
            Err(e) => {
                // Protocol error: answer 400 if the socket will take it,
                // then close. Keep-alive is forced off.
                tracing::debug!(fd = self.fd, error = ?e, "request parse error");
                self.keep_alive = false;
                self.stage_error(400, BODY_400);
                self.state = ConnState::Writing;
                ProcessOutcome::Error
            }
        }
    }

    /// Resolve the request target and assemble status line + headers into
    /// the write buffer, leaving the mapped file as the second segment.
    fn build_response(&mut self, root: &std::path::Path) {
        let method = self.parser.method.unwrap_or(Method::Get);
        let want_body = method != Method::Head;
        let target = std::mem::take(&mut self.parser.path);

        match files::lookup(root, &target, want_body) {
            Ok(served) => {
                self.stage_headers(200, served.mime, served.len);
                self.file = served.body;
                self.file_sent = 0;
            }
            Err(FileError::NotFound) => self.stage_error(404, BODY_404),
            Err(FileError::BadPath) | Err(FileError::Forbidden) => self.stage_error(400, BODY_400),
            Err(FileError::Io(e)) => {
                tracing::warn!(fd = self.fd, target = %target, error = %e, "file read failure");
                self.stage_error(500, BODY_500)
            }
        }
    }

    /// Resource-error responses carry a small inline body and follow the
    /// normal keep-alive decision.
    fn stage_error(&mut self, status: u16, body: &[u8]) {
        self.file = None;
        self.file_sent = 0;
        self.stage_headers(status, "text/html", body.len());
        let pos = self.header_len;
        if pos + body.len() <= self.write_buf.len() {
            self.write_buf[pos..pos + body.len()].copy_from_slice(body);
            self.header_len = pos + body.len();
        }
    }

    fn stage_headers(&mut self, status: u16, mime: &str, content_len: usize) {
        self.header_len = 0;
        self.header_sent = 0;

        let status_line: &[u8] = match status {
            200 => b"HTTP/1.1 200 OK\r\n",
            400 => b"HTTP/1.1 400 Bad Request\r\n",
            404 => b"HTTP/1.1 404 Not Found\r\n",
            500 => b"HTTP/1.1 500 Internal Server Error\r\n",
            _ => b"HTTP/1.1 500 Internal Server Error\r\n",
        };
        self.put(status_line);

        self.put(b"Date: ");
        self.put(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
        self.put(b"\r\n");

        self.put(b"Content-Type: ");
        self.put(mime.as_bytes());
        self.put(b"\r\n");

        self.put(b"Content-Length: ");
        let mut itoa_buf = [0u8; 20];
        let n = itoa(content_len, &mut itoa_buf);
        let digits = itoa_buf[..n].to_vec();
        self.put(&digits);
        self.put(b"\r\n");

        if self.keep_alive {
            self.put(b"Connection: keep-alive\r\n");
        } else {
            self.put(b"Connection: close\r\n");
        }

        self.put(b"\r\n");
    }

    fn put(&mut self, bytes: &[u8]) {
        // Config validation guarantees the write buffer holds a full header
        // block; the check keeps a misconfiguration from panicking.
        let pos = self.header_len;
        if pos + bytes.len() <= self.write_buf.len() {
            self.write_buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            self.header_len = pos + bytes.len();
        }
    }

    /// Write whatever remains of the staged response. The header segment is
    /// consumed first, then the mapped file; each keeps its own cursor so a
    /// short write resumes exactly where it stopped.
    fn step_flush(&mut self) -> EmberResult<ProcessOutcome> {
        loop {
            let header_rest = &self.write_buf[self.header_sent..self.header_len];
            let file_rest: &[u8] = match &self.file {
                Some(m) => &m.as_slice()[self.file_sent..],
                None => &[],
            };

            if header_rest.is_empty() && file_rest.is_empty() {
                return Ok(ProcessOutcome::Complete);
            }

            let mut segs: [&[u8]; 2] = [&[], &[]];
            let mut count = 0;
            if !header_rest.is_empty() {
                segs[count] = header_rest;
                count += 1;
            }
            if !file_rest.is_empty() {
                segs[count] = file_rest;
                count += 1;
            }

            let sent = syscalls::writev_nonblocking(self.fd, &segs[..count])?;
            if sent == 0 {
                // Would block: short write, stay armed for write-readiness.
                return Ok(ProcessOutcome::ResponseReady);
            }

            let header_take = sent.min(self.header_len - self.header_sent);
            self.header_sent += header_take;
            self.file_sent += sent - header_take;
        }
    }

    /// Bytes of the staged response sent so far, for the byte counters.
    pub fn response_bytes(&self) -> usize {
        self.header_sent + self.file_sent
    }

    /// After a fully transmitted keep-alive response: drop the mapping,
    /// reset the parser, and slide any already-drained bytes of the next
    /// request to the front of the read buffer.
    pub fn reset_for_next_request(&mut self) {
        self.file = None;
        self.file_sent = 0;
        self.header_len = 0;
        self.header_sent = 0;
        self.keep_alive = false;
        self.parser.reset();

        if self.filled > self.checked {
            self.read_buf.copy_within(self.checked..self.filled, 0);
        }
        self.filled -= self.checked;
        self.checked = 0;
        self.state = ConnState::Reading;
    }

    #[cfg(test)]
    pub fn inject(&mut self, bytes: &[u8]) {
        self.read_buf[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
    }

    #[cfg(test)]
    pub fn staged(&self) -> &[u8] {
        &self.write_buf[..self.header_len]
    }

    #[cfg(test)]
    pub fn staged_file_len(&self) -> Option<usize> {
        self.file.as_ref().map(|m| m.len())
    }
}

fn itoa(mut n: usize, buf: &mut [u8; 20]) -> usize {
    if n == 0 {
        buf[0] = b'0';
        return 1;
    }
    let mut i = 0;
    while n > 0 {
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        i += 1;
    }
    buf[..i].reverse();
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const READ_CAP: usize = 2048;
    const WRITE_CAP: usize = 1024;

    fn conn() -> Conn {
        let mut c = Conn::new(READ_CAP, WRITE_CAP);
        c.init(-1, None, 0);
        c
    }

    fn header_text(c: &Conn) -> String {
        String::from_utf8_lossy(c.staged()).into_owned()
    }

    #[test]
    fn serves_file_with_mapped_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), b"<h1>A</h1>").unwrap();

        let mut c = conn();
        c.inject(b"GET /a.html HTTP/1.1\r\nHost: t\r\n\r\n");
        let out = c.process(Readiness::Readable, dir.path()).unwrap();
        assert_eq!(out, ProcessOutcome::ResponseReady);

        let text = header_text(&c);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert_eq!(c.staged_file_len(), Some(10));
    }

    #[test]
    fn head_sends_headers_without_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();

        let mut c = conn();
        c.inject(b"HEAD /a.txt HTTP/1.1\r\n\r\n");
        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::ResponseReady
        );
        assert!(header_text(&c).contains("Content-Length: 5\r\n"));
        assert_eq!(c.staged_file_len(), None);
    }

    #[test]
    fn missing_file_stages_404_with_matching_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = conn();
        c.inject(b"GET /ghost.html HTTP/1.1\r\n\r\n");
        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::ResponseReady
        );
        let text = header_text(&c);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        let expected = format!("Content-Length: {}\r\n", BODY_404.len());
        assert!(text.contains(&expected));
        assert!(text.ends_with(std::str::from_utf8(BODY_404).unwrap()));
    }

    #[test]
    fn traversal_stages_400() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = conn();
        c.inject(b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::ResponseReady
        );
        assert!(header_text(&c).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn parse_error_forces_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = conn();
        c.inject(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::Error
        );
        let text = header_text(&c);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!c.keep_alive);
    }

    #[test]
    fn partial_request_needs_more_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = conn();
        c.inject(b"GET /a.html HTT");
        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::NeedMoreData
        );
    }

    #[test]
    fn keep_alive_reset_slides_pipelined_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"A").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"B").unwrap();

        let mut c = conn();
        // Both requests arrive in one drain.
        c.inject(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET /b.txt HTTP/1.1\r\nConnection: close\r\n\r\n");

        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::ResponseReady
        );
        assert!(c.keep_alive);
        assert!(c.has_buffered());

        c.reset_for_next_request();
        assert!(c.has_buffered());

        assert_eq!(
            c.process(Readiness::Readable, dir.path()).unwrap(),
            ProcessOutcome::ResponseReady
        );
        assert!(!c.keep_alive);
        assert!(header_text(&c).starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!c.has_buffered());
    }

    #[test]
    fn reset_releases_mapping_and_header_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let mut c = conn();
        c.inject(b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        c.process(Readiness::Readable, dir.path()).unwrap();
        assert!(c.staged_file_len().is_some());

        c.reset_for_next_request();
        assert!(c.staged_file_len().is_none());
        assert!(c.staged().is_empty());
        assert_eq!(c.state, ConnState::Reading);
    }
}

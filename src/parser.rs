// src/parser.rs
//
// Incremental HTTP/1.1 request parser. The parser owns no buffer; it scans
// CRLF-delimited lines out of the connection's read buffer from a caller-
// maintained cursor, so a request split across any number of reads parses
// identically to one that arrived whole.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    /// Only GET, HEAD and POST are served; anything else is a parse error.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Request line is not `METHOD SP target SP version`.
    BadRequestLine,
    /// Method token is not GET, HEAD or POST.
    UnsupportedMethod,
    /// Header line without a colon, or an unparseable Content-Length.
    BadHeader,
    /// A line (or a declared body) can never fit in the read buffer.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes must arrive before the request can complete.
    NeedMoreData,
    /// A full request (headers and body) has been consumed.
    Complete,
}

/// Per-connection parser state. Lives inside `Conn` and is reset between
/// keep-alive requests.
pub struct Parser {
    pub state: ParseState,
    pub method: Option<Method>,
    pub path: String,
    pub version: String,
    /// Lowercased names; a repeated header keeps the last value.
    pub headers: HashMap<String, String>,
    pub content_length: usize,
    pub keep_alive: bool,
    body_remaining: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: None,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            content_length: 0,
            keep_alive: false,
            body_remaining: 0,
        }
    }

    /// Clear everything for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = None;
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.body_remaining = 0;
    }

    /// Consume bytes from `buf[*checked..]`, advancing `checked` past every
    /// fully parsed line or body chunk. `capacity` is the read buffer's
    /// total size; a line that cannot terminate within it is `TooLarge`
    /// rather than an endless `NeedMoreData`.
    pub fn advance(
        &mut self,
        buf: &[u8],
        checked: &mut usize,
        capacity: usize,
    ) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let line = match find_line(buf, *checked) {
                        Some((line, next)) => {
                            let line = line.to_vec();
                            *checked = next;
                            line
                        }
                        None => return self.stall(buf, *checked, capacity),
                    };
                    self.parse_request_line(&line)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let (line, next) = match find_line(buf, *checked) {
                        Some((line, next)) => (line.to_vec(), next),
                        None => return self.stall(buf, *checked, capacity),
                    };
                    *checked = next;

                    if line.is_empty() {
                        // End of headers. Decide whether a body follows.
                        self.finish_headers()?;
                        if self.method != Some(Method::Post) || self.content_length == 0 {
                            return Ok(ParseStatus::Complete);
                        }
                        // The body accumulates after the headers with no
                        // compaction mid-request; if it cannot fit in the
                        // remaining buffer it can never complete.
                        if self.content_length > capacity - *checked {
                            return Err(ParseError::TooLarge);
                        }
                        self.body_remaining = self.content_length;
                        self.state = ParseState::Body;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                ParseState::Body => {
                    let avail = buf.len() - *checked;
                    let take = avail.min(self.body_remaining);
                    *checked += take;
                    self.body_remaining -= take;
                    if self.body_remaining == 0 {
                        return Ok(ParseStatus::Complete);
                    }
                    return Ok(ParseStatus::NeedMoreData);
                }
            }
        }
    }

    /// No complete line in the buffer: either wait for more bytes, or fail
    /// if the buffer is already full and the line can never terminate.
    fn stall(&self, buf: &[u8], checked: usize, capacity: usize) -> Result<ParseStatus, ParseError> {
        debug_assert!(checked <= buf.len());
        if buf.len() == capacity {
            Err(ParseError::TooLarge)
        } else {
            Ok(ParseStatus::NeedMoreData)
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.split(' ');
        let method = parts.next().ok_or(ParseError::BadRequestLine)?;
        let target = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version = parts.next().ok_or(ParseError::BadRequestLine)?;
        if parts.next().is_some() || method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(ParseError::BadRequestLine);
        }

        self.method =
            Some(Method::from_bytes(method.as_bytes()).ok_or(ParseError::UnsupportedMethod)?);
        self.path.push_str(target);
        // Recorded but never used to alter behavior; the Connection header
        // alone governs keep-alive.
        self.version.push_str(version);
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
        let colon = line.find(':').ok_or(ParseError::BadHeader)?;
        let name = &line[..colon];
        if name.is_empty() {
            return Err(ParseError::BadHeader);
        }
        let value = line[colon + 1..].trim();

        if name.eq_ignore_ascii_case("connection") {
            self.keep_alive = value.eq_ignore_ascii_case("keep-alive");
        }
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        if let Some(v) = self.headers.get("content-length") {
            self.content_length = v.parse::<usize>().map_err(|_| ParseError::BadHeader)?;
        }
        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the next CRLF-terminated line starting at `from`. Returns the line
/// (without CRLF) and the cursor position past the terminator.
fn find_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some((&buf[from..i], i + 2));
        }
        i += 1;
    }
    None
}

// End-to-end tests over real sockets: bind an ephemeral port, run the
// server on a background thread, and speak HTTP/1.1 to it with plain
// TcpStreams.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use ember::config::Config;
use ember::server::{Server, ServerHandle};

struct TestServer {
    handle: ServerHandle,
    port: u16,
    join: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(root: &Path, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root: root.to_path_buf(),
            workers: 2,
            ..Config::default()
        };
        tweak(&mut config);

        let server = Server::bind(config).expect("bind");
        let port = server.local_port();
        let handle = server.handle();
        let join = thread::spawn(move || {
            server.run().expect("run");
        });
        Self {
            handle,
            port,
            join: Some(join),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one framed response: headers to the blank line, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, HashMap<String, String>, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).expect("read headers");
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).expect("read body");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);

    (status_line, headers, body)
}

fn expect_eof(stream: &mut TcpStream) {
    let mut tmp = [0u8; 64];
    match stream.read(&mut tmp) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {} more bytes", n),
        Err(_) => {} // reset also counts as closed
    }
}

#[test]
fn serves_a_static_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), b"<h1>hello</h1>").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /page.html HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(headers.get("content-type").unwrap(), "text/html");
    assert_eq!(headers.get("content-length").unwrap(), "14");
    assert_eq!(headers.get("connection").unwrap(), "close");
    assert!(headers.contains_key("date"));
    assert_eq!(body, b"<h1>hello</h1>");
    expect_eof(&mut stream);
}

#[test]
fn root_path_serves_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"home").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"home");
}

#[test]
fn missing_file_is_404_with_exact_content_length() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /nope.html HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 404 Not Found");
    assert_eq!(
        headers.get("content-length").unwrap().parse::<usize>().unwrap(),
        body.len()
    );
}

#[test]
fn path_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ok.txt"), b"fine").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    assert!(!body.windows(5).any(|w| w == b"root:"));
}

#[test]
fn unsupported_method_gets_400_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"BREW /pot HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, headers, _) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    // Error responses force keep-alive off.
    assert_eq!(headers.get("connection").unwrap(), "close");
    expect_eof(&mut stream);
}

#[test]
fn head_returns_headers_only() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), vec![0u8; 4096]).unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"HEAD /data.bin HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 4096\r\n"));
    // Headers only: the stream ends right after the blank line.
    assert!(text.ends_with("\r\n\r\n"));
}

#[test]
fn post_consumes_body_then_serves_target() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("form.html"), b"<form/>").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(
            b"POST /form.html HTTP/1.1\r\nHost: t\r\nContent-Length: 7\r\nConnection: close\r\n\r\nname=ab",
        )
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"<form/>");
}

#[test]
fn keep_alive_serves_two_requests_then_closes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"first").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"second!").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    // Both requests in a single segment: the second must be answered from
    // bytes already drained, with no further readiness event.
    stream
        .write_all(
            b"GET /a.txt HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n\
              GET /b.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .unwrap();

    let (status1, headers1, body1) = read_response(&mut stream);
    assert_eq!(status1, "HTTP/1.1 200 OK");
    assert_eq!(headers1.get("connection").unwrap(), "keep-alive");
    assert_eq!(body1, b"first");

    let (status2, headers2, body2) = read_response(&mut stream);
    assert_eq!(status2, "HTTP/1.1 200 OK");
    assert_eq!(headers2.get("connection").unwrap(), "close");
    assert_eq!(body2, b"second!");

    expect_eof(&mut stream);
}

#[test]
fn keep_alive_with_separated_requests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x.txt"), b"xx").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /x.txt HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"xx");

    // Second request arrives much later on the same socket.
    thread::sleep(Duration::from_millis(50));
    stream
        .write_all(b"GET /x.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"xx");
    expect_eof(&mut stream);
}

#[test]
fn request_split_at_byte_boundaries_still_parses() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("s.txt"), b"split").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    let req = b"GET /s.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n";
    for chunk in req.chunks(3) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"split");
}

#[test]
fn oversized_request_line_gets_400_not_a_hang() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), |c| c.read_buf_size = 1024);

    let mut stream = server.connect();
    let mut req = Vec::from(&b"GET /"[..]);
    req.extend(std::iter::repeat(b'a').take(4096));
    req.extend_from_slice(b" HTTP/1.1\r\n\r\n");
    stream.write_all(&req).unwrap();

    let (status, _, _) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    expect_eof(&mut stream);
}

#[test]
fn connections_beyond_the_table_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"ok").unwrap();
    let server = TestServer::start(dir.path(), |c| c.max_connections = 1);

    // First connection claims the only slot; a request proves it is live.
    let mut first = server.connect();
    first
        .write_all(b"GET /a.txt HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (status, _, _) = read_response(&mut first);
    assert_eq!(status, "HTTP/1.1 200 OK");

    // Second connection is accepted at the TCP level, then closed by
    // admission control without any response.
    let mut second = server.connect();
    expect_eof(&mut second);

    // The first connection is unaffected.
    first
        .write_all(b"GET /a.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (status, _, _) = read_response(&mut first);
    assert_eq!(status, "HTTP/1.1 200 OK");
}

#[test]
fn idle_connections_are_evicted_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), |c| c.idle_timeout_secs = 1);

    let mut stream = server.connect();
    // Never send a request; the sweep should close the socket.
    let started = std::time::Instant::now();
    expect_eof(&mut stream);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[test]
fn unknown_extension_defaults_to_octet_stream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blob.xyz"), b"\x00\x01\x02").unwrap();
    let server = TestServer::start(dir.path(), |_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /blob.xyz HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (status, headers, body) = read_response(&mut stream);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(headers.get("content-type").unwrap(), "application/octet-stream");
    assert_eq!(body, b"\x00\x01\x02");
}

/*
 * client.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the HTTP client against a local mock server that
 * serves canned responses and records the bytes each request put on the
 * wire.
 */

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;

use staffetta::{HttpRequest, Lifecycle, submit};

/// A loopback server that answers `responses.len()` connections in order
/// and hands back the raw request bytes it saw.
struct MockServer {
    addr: SocketAddr,
    thread: JoinHandle<Vec<Vec<u8>>>,
}

impl MockServer {
    fn serve(responses: Vec<Vec<u8>>) -> MockServer {
        MockServer::serve_with_delay(responses, 0)
    }

    fn serve_with_delay(responses: Vec<Vec<u8>>, delay_ms: u64) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let thread = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut sock, _) = listener.accept().unwrap();
                requests.push(read_http_request(&mut sock));
                if delay_ms > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                }
                sock.write_all(&response).unwrap();
                let _ = sock.shutdown(Shutdown::Both);
            }
            requests
        });
        MockServer { addr, thread }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    fn finish(self) -> Vec<Vec<u8>> {
        self.thread.join().unwrap()
    }
}

/// Read one full HTTP request: headers, then a Content-Length body if one
/// was announced.
fn read_http_request(sock: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(head_end) = find(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..head_end]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() - head_end - 4 >= content_length {
                return data;
            }
        }
        match sock.read(&mut buf) {
            Ok(0) | Err(_) => return data,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn response(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[test]
fn get_with_content_length() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
    )]);
    let handle = submit(HttpRequest::new(server.url("/hello")));
    let result = handle.wait();

    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.status, 200);
    assert_eq!(result.body.as_deref(), Some(&b"hello"[..]));
    assert_eq!(
        result.headers.get("content-length").map(String::as_str),
        Some("5")
    );

    let requests = server.finish();
    let text = String::from_utf8_lossy(&requests[0]);
    assert!(text.starts_with("GET /hello HTTP/1.1\r\n"));
    assert!(text.contains("\r\nHost: 127.0.0.1\r\n"));
    assert!(text.contains("\r\nConnection: close\r\n"));
}

#[test]
fn progress_counters_settle_at_totals() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
    )]);
    let handle = submit(HttpRequest::new(server.url("/p")));
    let result = handle_progress_after_wait(handle);
    assert_eq!(result.0, 5);
    assert_eq!(result.1, 5);
    server.finish();
}

/// wait() consumes the handle, so snapshot progress through a second probe
/// of the shared counters right before collecting.
fn handle_progress_after_wait(handle: staffetta::RequestHandle) -> (u64, i64) {
    while !handle.is_done() {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let progress = handle.progress();
    let result = handle.wait();
    assert!(result.error.is_none());
    (progress.downloaded, progress.total)
}

#[test]
fn chunked_body_reassembles() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )]);
    let handle = submit(HttpRequest::new(server.url("/w")));
    let result = handle.wait();

    assert!(result.error.is_none());
    assert_eq!(result.status, 200);
    assert_eq!(result.body.as_deref(), Some(&b"Wikipedia"[..]));
    server.finish();
}

#[test]
fn body_without_framing_reads_until_close() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nX-A: b\r\n\r\nstream until close",
    )]);
    let handle = submit(HttpRequest::new(server.url("/s")));
    let result = handle.wait();

    assert!(result.error.is_none());
    assert_eq!(result.body.as_deref(), Some(&b"stream until close"[..]));
    assert_eq!(result.headers.get("x-a").map(String::as_str), Some("b"));
    server.finish();
}

#[test]
fn zero_content_length_reads_no_body() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n",
    )]);
    let result = submit(HttpRequest::new(server.url("/none"))).wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 204);
    assert_eq!(result.body.as_deref(), Some(&b""[..]));
    server.finish();
}

#[test]
fn post_transmits_headers_and_body_in_order() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let handle = submit(
        HttpRequest::new(server.url("/path"))
            .method("POST")
            .header("X-Custom", "yes")
            .body(b"ab".to_vec()),
    );
    let result = handle.wait();
    assert!(result.error.is_none());

    let requests = server.finish();
    let text = String::from_utf8_lossy(&requests[0]).into_owned();
    assert!(text.starts_with("POST /path HTTP/1.1\r\n"));
    assert!(text.ends_with("\r\n\r\nab"));
    assert!(text.contains("\r\nContent-Length: 2\r\n"));

    let host = text.find("\r\nHost: ").unwrap();
    let agent = text.find("\r\nUser-Agent: Staffetta/0.1\r\n").unwrap();
    let close = text.find("\r\nConnection: close\r\n").unwrap();
    let custom = text.find("\r\nX-Custom: yes\r\n").unwrap();
    assert!(host < agent && agent < close && close < custom);
}

#[test]
fn absolute_redirect_switches_servers() {
    let target = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )]);
    let hop = MockServer::serve(vec![response(&format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
        target.url("/y")
    ))]);

    let result = submit(HttpRequest::new(hop.url("/x"))).wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 200);
    assert_eq!(result.body.as_deref(), Some(&b"ok"[..]));

    hop.finish();
    let target_requests = target.finish();
    assert!(String::from_utf8_lossy(&target_requests[0]).starts_with("GET /y HTTP/1.1\r\n"));
}

#[test]
fn path_only_redirect_keeps_the_authority() {
    let server = MockServer::serve(vec![
        response("HTTP/1.1 302 Found\r\nLocation: /moved\r\nContent-Length: 0\r\n\r\n"),
        response("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nhere"),
    ]);
    let result = submit(HttpRequest::new(server.url("/start"))).wait();
    assert!(result.error.is_none());
    assert_eq!(result.body.as_deref(), Some(&b"here"[..]));

    let requests = server.finish();
    assert!(String::from_utf8_lossy(&requests[1]).starts_with("GET /moved HTTP/1.1\r\n"));
}

#[test]
fn see_other_rewrites_method_to_get() {
    let target = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    )]);
    let hop = MockServer::serve(vec![response(&format!(
        "HTTP/1.1 303 See Other\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
        target.url("/result")
    ))]);

    let result = submit(
        HttpRequest::new(hop.url("/submit"))
            .method("POST")
            .body(b"payload".to_vec()),
    )
    .wait();
    assert!(result.error.is_none());

    hop.finish();
    let target_requests = target.finish();
    assert!(String::from_utf8_lossy(&target_requests[0]).starts_with("GET /result HTTP/1.1\r\n"));
}

#[test]
fn redirect_without_location_is_a_final_response() {
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 301 Moved Permanently\r\nContent-Length: 4\r\n\r\ngone",
    )]);
    let result = submit(HttpRequest::new(server.url("/x"))).wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 301);
    assert_eq!(result.body.as_deref(), Some(&b"gone"[..]));
    server.finish();
}

#[test]
fn eleven_hops_exhaust_the_redirect_limit() {
    let hops: Vec<Vec<u8>> = (0..11)
        .map(|_| response("HTTP/1.1 301 Moved Permanently\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n"))
        .collect();
    let server = MockServer::serve(hops);

    let handle = submit(HttpRequest::new(server.url("/start")));
    let result = handle.wait();
    let requests = server.finish();

    assert_eq!(requests.len(), 11);
    assert_eq!(result.status, 0);
    assert_eq!(
        result.error.map(|e| e.to_string()),
        Some("too many redirects (max 10)".to_string())
    );
}

#[test]
fn download_to_file_leaves_body_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\npayload!",
    )]);

    let result = submit(HttpRequest::new(server.url("/f")).output(&path)).wait();
    assert!(result.error.is_none());
    assert!(result.body.is_none());
    assert_eq!(std::fs::read(&path).unwrap(), b"payload!");
    server.finish();
}

#[test]
fn resume_appends_on_206() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.bin");
    std::fs::write(&path, vec![b'x'; 100]).unwrap();

    let mut body = String::from("HTTP/1.1 206 Partial Content\r\nContent-Length: 50\r\n\r\n");
    body.push_str(&"y".repeat(50));
    let server = MockServer::serve(vec![response(&body)]);

    let handle = submit(HttpRequest::new(server.url("/big")).output(&path));
    while !handle.is_done() {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let progress = handle.progress();
    let result = handle.wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 206);

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 150);
    assert!(data[..100].iter().all(|&b| b == b'x'));
    assert!(data[100..].iter().all(|&b| b == b'y'));
    assert_eq!(progress.downloaded, 150);
    assert_eq!(progress.total, 150);

    let requests = server.finish();
    assert!(String::from_utf8_lossy(&requests[0]).contains("\r\nRange: bytes=100-\r\n"));
}

#[test]
fn resume_restarts_on_200() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restarted.bin");
    std::fs::write(&path, vec![b'x'; 100]).unwrap();

    let mut body = String::from("HTTP/1.1 200 OK\r\nContent-Length: 30\r\n\r\n");
    body.push_str(&"z".repeat(30));
    let server = MockServer::serve(vec![response(&body)]);

    let result = submit(HttpRequest::new(server.url("/big")).output(&path)).wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 200);

    let data = std::fs::read(&path).unwrap();
    assert_eq!(data.len(), 30);
    assert!(data.iter().all(|&b| b == b'z'));
    server.finish();
}

#[test]
fn override_skips_the_range_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.bin");
    std::fs::write(&path, vec![b'x'; 100]).unwrap();

    let server = MockServer::serve(vec![response(
        "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nnew",
    )]);
    let result = submit(
        HttpRequest::new(server.url("/fresh"))
            .output(&path)
            .overwrite(true),
    )
    .wait();
    assert!(result.error.is_none());
    assert_eq!(std::fs::read(&path).unwrap(), b"new");

    let requests = server.finish();
    assert!(!String::from_utf8_lossy(&requests[0]).contains("Range:"));
}

#[test]
fn invalid_url_fails_without_connecting() {
    let result = submit(HttpRequest::new("ftp://example.test/x")).wait();
    assert_eq!(result.status, 0);
    assert_eq!(
        result.error.map(|e| e.to_string()),
        Some("invalid URL: ftp://example.test/x".to_string())
    );
}

#[test]
fn connect_failure_surfaces_as_error_lifecycle() {
    // Bind a listener and drop it so the port is (very likely) closed.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let handle = submit(HttpRequest::new(format!("http://127.0.0.1:{}/x", port)).timeout(2.0));
    let result = handle.wait();
    assert_eq!(result.status, 0);
    assert!(result.error.is_some());
}

#[test]
fn is_done_polls_while_the_server_stalls() {
    let server = MockServer::serve_with_delay(
        vec![response("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")],
        150,
    );
    let handle = submit(HttpRequest::new(server.url("/slow")));
    assert_eq!(handle.lifecycle(), Lifecycle::Running);
    while !handle.is_done() {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(handle.lifecycle(), Lifecycle::Done);
    let result = handle.wait();
    assert_eq!(result.body.as_deref(), Some(&b"ok"[..]));
    server.finish();
}

/*
 * shutdown.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Process-wide teardown runs in its own test binary so it cannot race the
 * other integration tests' in-flight requests.
 */

use std::io::{Read, Write};
use std::net::TcpListener;

use staffetta::{submit, tls_available, HttpRequest};

fn serve_one_ok() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://127.0.0.1:{}/", listener.local_addr().unwrap().port());
    std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        while let Ok(n) = sock.read(&mut buf) {
            if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
    });
    url
}

#[test]
fn shutdown_releases_and_resubmit_restarts() {
    // The probe is idempotent either way the platform answers.
    assert_eq!(tls_available(), tls_available());

    let result = submit(HttpRequest::new(serve_one_ok())).wait();
    assert!(result.error.is_none());
    assert_eq!(result.status, 200);

    staffetta::shutdown();

    // A fresh submit after teardown brings the runtime back up.
    let result = submit(HttpRequest::new(serve_one_ok())).wait();
    assert!(result.error.is_none());
    assert_eq!(result.body.as_deref(), Some(&b"ok"[..]));

    staffetta::shutdown();
}

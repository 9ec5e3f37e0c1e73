/*
 * h1.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, a lightweight asynchronous HTTP client.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HTTP/1.1 codec: request serialization, status line and header parsing,
//! body reading for the three framings (chunked, content-length,
//! read-to-close).

use bytes::BytesMut;
use std::io;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::connection::Connection;
use crate::error::HttpError;
use crate::request::Shared;
use crate::url::ParsedUrl;

/// Product token sent with every request.
pub(crate) const USER_AGENT: &str = "Staffetta/0.1";

const BLOCK: usize = 8192;

/// Serialize one request. Fixed header order: request line, Host,
/// User-Agent, Connection, user headers in insertion order, optional Range,
/// optional Content-Length, blank line, body.
pub(crate) fn build_request(
    method: &str,
    url: &ParsedUrl,
    headers: &[(String, String)],
    resume_offset: u64,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.map_or(0, <[u8]>::len));
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(url.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(url.host.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"User-Agent: ");
    out.extend_from_slice(USER_AGENT.as_bytes());
    out.extend_from_slice(b"\r\n");
    // One request per connection.
    out.extend_from_slice(b"Connection: close\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if resume_offset > 0 {
        out.extend_from_slice(format!("Range: bytes={}-\r\n", resume_offset).as_bytes());
    }
    let body = body.filter(|b| !b.is_empty());
    if let Some(body) = body {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

/// Status line and headers of one response, with the three fields the
/// client acts on extracted.
pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    /// Raw header lines, one per line, `\n`-terminated.
    pub(crate) raw_headers: String,
    /// -1 when the server did not send Content-Length.
    pub(crate) content_length: i64,
    pub(crate) chunked: bool,
    pub(crate) location: Option<String>,
}

/// Where body bytes go: memory or the output file, never both.
pub(crate) enum BodySink {
    Memory(Vec<u8>),
    File(File),
}

impl BodySink {
    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), HttpError> {
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::File(file) => file
                .write_all(data)
                .await
                .map_err(|_| HttpError::FileWrite("failed to write output file".to_string())),
        }
    }

    /// Flush and return the in-memory body, or None when the body went to a
    /// file.
    pub(crate) async fn finish(self) -> Result<Option<Vec<u8>>, HttpError> {
        match self {
            BodySink::Memory(buf) => Ok(Some(buf)),
            BodySink::File(mut file) => {
                file.flush()
                    .await
                    .map_err(|_| HttpError::FileWrite("failed to write output file".to_string()))?;
                Ok(None)
            }
        }
    }
}

/// Buffered reader over a Connection. Fills in blocks, hands out lines and
/// body chunks; bytes that arrived behind the headers are served before the
/// socket is read again.
pub(crate) struct ResponseReader {
    buf: BytesMut,
}

impl ResponseReader {
    pub(crate) fn new() -> ResponseReader {
        ResponseReader {
            buf: BytesMut::with_capacity(BLOCK),
        }
    }

    async fn fill(&mut self, conn: &mut Connection) -> io::Result<usize> {
        let mut tmp = [0u8; BLOCK];
        let n = conn.read(&mut tmp).await?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// One line up to CRLF; the CRLF is consumed but not returned. A lone
    /// `\r` not followed by `\n` stays in the content. EOF before the CRLF
    /// is an error.
    pub(crate) async fn read_line(&mut self, conn: &mut Connection) -> Result<BytesMut, HttpError> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let mut line = self.buf.split_to(pos + 2);
                line.truncate(pos);
                return Ok(line);
            }
            match self.fill(conn).await {
                Ok(0) => return Err(HttpError::Receive("unexpected end of stream".to_string())),
                Ok(_) => {}
                Err(e) => return Err(HttpError::Receive(e.to_string())),
            }
        }
    }

    /// Status line plus headers, up to and including the blank line.
    pub(crate) async fn read_head(&mut self, conn: &mut Connection) -> Result<ResponseHead, HttpError> {
        let status_line = self
            .read_line(conn)
            .await
            .map_err(|_| HttpError::Receive("failed to read status line".to_string()))?;
        let mut head = ResponseHead {
            status: parse_status(&status_line),
            raw_headers: String::new(),
            content_length: -1,
            chunked: false,
            location: None,
        };

        loop {
            let line = self
                .read_line(conn)
                .await
                .map_err(|_| HttpError::Receive("failed to read headers".to_string()))?;
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            head.raw_headers.push_str(&text);
            head.raw_headers.push('\n');

            if let Some((name, value)) = split_header(&text) {
                if name.eq_ignore_ascii_case("content-length") {
                    head.content_length = value.trim().parse::<i64>().unwrap_or(-1);
                } else if name.eq_ignore_ascii_case("transfer-encoding") {
                    if value.to_ascii_lowercase().contains("chunked") {
                        head.chunked = true;
                    }
                } else if name.eq_ignore_ascii_case("location") {
                    head.location = Some(value.to_string());
                }
            }
        }
        Ok(head)
    }

    /// Up to `limit` body bytes, from the buffer or one socket read. Empty
    /// result is peer close.
    async fn read_some(&mut self, conn: &mut Connection, limit: usize) -> io::Result<BytesMut> {
        if self.buf.is_empty() {
            let n = self.fill(conn).await?;
            if n == 0 {
                return Ok(BytesMut::new());
            }
        }
        let take = self.buf.len().min(limit);
        Ok(self.buf.split_to(take))
    }

    /// Read exactly `count` body bytes into the sink.
    pub(crate) async fn read_exact_body(
        &mut self,
        conn: &mut Connection,
        count: u64,
        sink: &mut BodySink,
        shared: &Shared,
        context: &str,
    ) -> Result<(), HttpError> {
        let mut remaining = count;
        while remaining > 0 {
            let limit = remaining.min(65536) as usize;
            let chunk = self
                .read_some(conn, limit)
                .await
                .map_err(|_| HttpError::Receive(context.to_string()))?;
            if chunk.is_empty() {
                return Err(HttpError::Receive(context.to_string()));
            }
            sink.write(&chunk).await?;
            shared.add_downloaded(chunk.len() as u64);
            remaining -= chunk.len() as u64;
        }
        Ok(())
    }

    /// Chunked transfer encoding: hex size line, data, CRLF, repeated until
    /// the zero-size chunk.
    pub(crate) async fn read_chunked(
        &mut self,
        conn: &mut Connection,
        sink: &mut BodySink,
        shared: &Shared,
    ) -> Result<(), HttpError> {
        loop {
            let line = match self.read_line(conn).await {
                Ok(line) => line,
                Err(_) => break,
            };
            let chunk_size = parse_hex_prefix(&line);
            if chunk_size == 0 {
                // Trailing CRLF after the last chunk.
                let _ = self.read_line(conn).await;
                break;
            }
            self.read_exact_body(conn, chunk_size, sink, shared, "failed to read chunked body")
                .await?;
            // CRLF terminating this chunk's data.
            let _ = self.read_line(conn).await;
        }
        Ok(())
    }

    /// No framing: everything until the peer closes.
    pub(crate) async fn read_to_close(
        &mut self,
        conn: &mut Connection,
        sink: &mut BodySink,
        shared: &Shared,
    ) -> Result<(), HttpError> {
        loop {
            let chunk = match self.read_some(conn, BLOCK).await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.is_empty() {
                break;
            }
            sink.write(&chunk).await?;
            shared.add_downloaded(chunk.len() as u64);
        }
        Ok(())
    }
}

/// Byte offset of the first CRLF pair, if any.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// The integer after the first run of non-space characters; 0 when absent.
fn parse_status(line: &[u8]) -> u16 {
    let mut i = 0;
    while i < line.len() && line[i] != b' ' {
        i += 1;
    }
    while i < line.len() && line[i] == b' ' {
        i += 1;
    }
    let mut status: u32 = 0;
    let mut any = false;
    while i < line.len() && line[i].is_ascii_digit() {
        status = status * 10 + u32::from(line[i] - b'0');
        if status > u32::from(u16::MAX) {
            return 0;
        }
        any = true;
        i += 1;
    }
    if any {
        status as u16
    } else {
        0
    }
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    Some((&line[..colon], line[colon + 1..].trim_start_matches(' ')))
}

/// Hex prefix of a chunk-size line, both cases accepted; parsing stops at
/// the first non-hex byte (chunk extensions are ignored).
fn parse_hex_prefix(line: &[u8]) -> u64 {
    let mut val: u64 = 0;
    for &c in line {
        let digit = match c {
            b'0'..=b'9' => u64::from(c - b'0'),
            b'a'..=b'f' => u64::from(c - b'a' + 10),
            b'A'..=b'F' => u64::from(c - b'A' + 10),
            _ => break,
        };
        val = (val << 4) | digit;
    }
    val
}

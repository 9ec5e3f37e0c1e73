/*
 * connection.rs
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

//! One connection: a TCP stream plus an optional TLS session, behind uniform
//! byte read/write. Name resolution tries each resolved address in turn.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::error::HttpError;
use crate::tls::TlsSession;
use crate::url::ParsedUrl;

const DEFAULT_CONNECT_TIMEOUT_SECS: f32 = 30.0;

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

#[derive(Debug)]
pub(crate) struct Connection {
    stream: Stream,
    tls: Option<TlsSession>,
}

impl Connection {
    /// Resolve and connect, then handshake when the scheme is secure. The
    /// timeout bounds each connect attempt; reads and writes afterwards are
    /// not deadlined.
    pub(crate) async fn connect(url: &ParsedUrl, timeout_secs: f32) -> Result<Connection, HttpError> {
        let authority = format!("{}:{}", url.host, url.port);
        let addrs: Vec<_> = lookup_host(authority.as_str())
            .await
            .map_err(|e| HttpError::Resolve(format!("getaddrinfo({}) failed: {}", authority, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(HttpError::Resolve(format!(
                "getaddrinfo({}) failed: no addresses",
                authority
            )));
        }

        let connect_timeout = Duration::from_secs_f32(
            if timeout_secs.is_finite() && timeout_secs > 0.0 {
                timeout_secs
            } else {
                DEFAULT_CONNECT_TIMEOUT_SECS
            },
        );

        let mut connected = None;
        let mut last_err = String::from("unreachable");
        for addr in addrs {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    connected = Some(stream);
                    break;
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "timed out".to_string(),
            }
        }
        let mut stream = match connected {
            Some(s) => s,
            None => {
                return Err(HttpError::Connect(format!(
                    "connect({}) failed: {}",
                    authority, last_err
                )))
            }
        };

        let tls = if url.secure {
            // Handshake failure drops the socket with the error.
            Some(TlsSession::handshake(&mut stream, &url.host).await?)
        } else {
            None
        };

        Ok(Connection {
            stream: Stream::Tcp(stream),
            tls,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_duplex(stream: tokio::io::DuplexStream) -> Connection {
        Connection {
            stream: Stream::Mem(stream),
            tls: None,
        }
    }

    /// Read into `buf`. Ok(0) is peer close.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (&mut self.tls, &mut self.stream) {
            (Some(tls), Stream::Tcp(s)) => tls.recv(s, buf).await,
            (None, Stream::Tcp(s)) => s.read(buf).await,
            #[cfg(test)]
            (_, Stream::Mem(s)) => s.read(buf).await,
        }
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match (&mut self.tls, &mut self.stream) {
            (Some(tls), Stream::Tcp(s)) => tls.send(s, data).await,
            (None, Stream::Tcp(s)) => s.write(data).await,
            #[cfg(test)]
            (_, Stream::Mem(s)) => s.write(data).await,
        }
    }

    pub(crate) async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while sending",
                ));
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Close TLS first, then the socket. Safe to call more than once.
    pub(crate) async fn close(&mut self) {
        if let Some(mut tls) = self.tls.take() {
            if let Stream::Tcp(s) = &mut self.stream {
                tls.close(s).await;
            }
        }
        match &mut self.stream {
            Stream::Tcp(s) => {
                let _ = s.shutdown().await;
            }
            #[cfg(test)]
            Stream::Mem(s) => {
                let _ = s.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_reports_the_authority() {
        // Port 1 on loopback is essentially never listening.
        let url = ParsedUrl::parse("http://127.0.0.1:1/").unwrap();
        let err = Connection::connect(&url, 2.0).await.unwrap_err();
        match err {
            HttpError::Connect(msg) => assert!(msg.starts_with("connect(127.0.0.1:1) failed:")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn resolve_failure_reports_the_authority() {
        let url = ParsedUrl::parse("http://no-such-host.invalid/").unwrap();
        let err = Connection::connect(&url, 2.0).await.unwrap_err();
        match err {
            HttpError::Resolve(msg) => {
                assert!(msg.starts_with("getaddrinfo(no-such-host.invalid:80) failed:"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Connection::from_duplex(client);
        conn.close().await;
        conn.close().await;
    }
}

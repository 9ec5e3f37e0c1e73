/*
 * executor.rs
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

//! Per-request worker: the redirect loop, body destination selection (memory
//! or file, with resume via Range), and terminal-state publication.

use std::sync::Arc;

use log::debug;
use tokio::fs::{File, OpenOptions};

use crate::connection::Connection;
use crate::error::HttpError;
use crate::h1::{self, BodySink, ResponseReader};
use crate::request::{HttpRequest, Outcome, Shared};
use crate::tls;
use crate::url::ParsedUrl;

const MAX_REDIRECTS: usize = 10;

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Resolve a `Location` header against the URL that produced it. A path
/// keeps the scheme and authority; anything else is taken as absolute.
fn resolve_location(url: &ParsedUrl, location: &str) -> String {
    if location.starts_with('/') {
        format!("{}{}", url.origin(), location)
    } else {
        location.to_string()
    }
}

/// Entry point of the worker task: run the request, publish the outcome.
pub(crate) async fn run(request: HttpRequest, shared: Arc<Shared>) {
    match perform(&request, &shared).await {
        Ok(outcome) => shared.finish(outcome),
        Err(error) => shared.finish(Outcome {
            status: 0,
            raw_headers: String::new(),
            body: None,
            error: Some(error),
        }),
    }
}

async fn perform(request: &HttpRequest, shared: &Shared) -> Result<Outcome, HttpError> {
    // An existing output file is resumed unless the caller asked for a
    // fresh download.
    let mut resume_offset: u64 = 0;
    if let Some(path) = &request.output_path {
        if !request.output_override {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                resume_offset = meta.len();
                if resume_offset > 0 {
                    debug!(
                        "resume: existing file {} is {} bytes",
                        path.display(),
                        resume_offset
                    );
                }
            }
        }
    }

    let mut current_url = request.url.clone();
    let mut method = request.method.clone();

    for _ in 0..=MAX_REDIRECTS {
        let url = ParsedUrl::parse(&current_url)?;
        if url.secure {
            tls::ensure().map_err(HttpError::TlsUnavailable)?;
        }

        let mut conn = Connection::connect(&url, request.timeout_secs).await?;

        let request_bytes = h1::build_request(
            &method,
            &url,
            &request.headers,
            resume_offset,
            request.body.as_deref(),
        );
        conn.write_all(&request_bytes)
            .await
            .map_err(|_| HttpError::Send("failed to send request".to_string()))?;
        shared.add_uploaded(request_bytes.len() as u64);

        let mut reader = ResponseReader::new();
        let head = reader.read_head(&mut conn).await?;
        shared.set_content_length(head.content_length);

        if is_redirect(head.status) {
            if let Some(location) = &head.location {
                conn.close().await;
                let next_url = resolve_location(&url, location);
                debug!("redirect {}: {} -> {}", head.status, current_url, next_url);
                current_url = next_url;
                // 303 means the next request fetches the result.
                if head.status == 303 {
                    method = "GET".to_string();
                }
                shared.set_content_length(-1);
                continue;
            }
        }

        // The body destination is chosen once, after redirects settle.
        let mut sink = match &request.output_path {
            None => BodySink::Memory(Vec::new()),
            Some(path) => {
                if resume_offset > 0 && head.status == 206 {
                    let file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(path)
                        .await
                        .map_err(|_| {
                            HttpError::FileOpen(format!(
                                "failed to open output file: {}",
                                path.display()
                            ))
                        })?;
                    // The first resume_offset bytes are already on disk.
                    shared.set_downloaded(resume_offset);
                    if head.content_length >= 0 {
                        shared.set_content_length(head.content_length + resume_offset as i64);
                    }
                    debug!("resuming at offset {} (status 206)", resume_offset);
                    BodySink::File(file)
                } else {
                    // A 200 against a Range request restarts from zero.
                    if resume_offset > 0 && head.status == 200 {
                        debug!("server ignored the range request, restarting download");
                    }
                    let file = File::create(path).await.map_err(|_| {
                        HttpError::FileOpen(format!(
                            "failed to open output file: {}",
                            path.display()
                        ))
                    })?;
                    BodySink::File(file)
                }
            }
        };

        // Framing priority: chunked, then content-length, then read to
        // close.
        if head.chunked {
            reader.read_chunked(&mut conn, &mut sink, shared).await?;
        } else if head.content_length >= 0 {
            reader
                .read_exact_body(
                    &mut conn,
                    head.content_length as u64,
                    &mut sink,
                    shared,
                    "failed to read body",
                )
                .await?;
        } else {
            reader.read_to_close(&mut conn, &mut sink, shared).await?;
        }

        conn.close().await;
        let body = sink.finish().await?;
        return Ok(Outcome {
            status: head.status,
            raw_headers: head.raw_headers,
            body,
            error: None,
        });
    }

    Err(HttpError::TooManyRedirects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_statuses() {
        for status in [301, 302, 303, 307, 308] {
            assert!(is_redirect(status));
        }
        for status in [200, 206, 300, 304, 400] {
            assert!(!is_redirect(status));
        }
    }

    #[test]
    fn path_location_keeps_scheme_host_port() {
        let url = ParsedUrl::parse("https://example.test/a").unwrap();
        assert_eq!(
            resolve_location(&url, "/b?x=1"),
            "https://example.test/b?x=1"
        );
        let with_port = ParsedUrl::parse("http://example.test:8080/a").unwrap();
        assert_eq!(
            resolve_location(&with_port, "/b"),
            "http://example.test:8080/b"
        );
    }

    #[test]
    fn default_port_is_omitted_from_resolved_location() {
        let url = ParsedUrl::parse("http://example.test:80/a").unwrap();
        assert_eq!(resolve_location(&url, "/b"), "http://example.test/b");
    }

    #[test]
    fn absolute_location_replaces_everything() {
        let url = ParsedUrl::parse("https://example.test/a").unwrap();
        assert_eq!(
            resolve_location(&url, "http://other.test/x"),
            "http://other.test/x"
        );
    }
}

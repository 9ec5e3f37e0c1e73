/*
 * request.rs
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

//! Request descriptor, handle, and the state shared between the worker task
//! and observers. The worker owns every non-atomic field while the request
//! is running; observers see only the atomic counters and the lifecycle
//! word. The worker publishes its terminal state with a release store after
//! all other writes; readers pair it with acquire loads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::HttpError;

/// One request, immutable once submitted. Build with the chained setters,
/// then pass to `submit`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    /// Sent in insertion order; repeats are kept, nothing is folded.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Bounds the connect attempt; reads and writes are not deadlined.
    pub timeout_secs: f32,
    /// Stream the response body to this file instead of memory.
    pub output_path: Option<PathBuf>,
    /// Overwrite an existing output file instead of resuming it.
    pub output_override: bool,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            timeout_secs: 30.0,
            output_path: None,
            output_override: false,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, seconds: f32) -> Self {
        self.timeout_secs = seconds;
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.output_override = overwrite;
        self
    }
}

/// Where a request is in its life. Transitions are one-way:
/// running -> done or running -> error, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Done,
    Error,
}

const LIFECYCLE_RUNNING: u8 = 0;
const LIFECYCLE_DONE: u8 = 1;
const LIFECYCLE_ERROR: u8 = 2;

/// Byte counters, readable at any time while the request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    /// Expected total, -1 when the server did not say.
    pub total: i64,
}

/// Terminal result of the worker task.
pub(crate) struct Outcome {
    pub(crate) status: u16,
    pub(crate) raw_headers: String,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) error: Option<HttpError>,
}

/// State shared between the worker task and observers.
pub(crate) struct Shared {
    lifecycle: AtomicU8,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    content_length: AtomicI64,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Shared {
    pub(crate) fn new() -> Shared {
        Shared {
            lifecycle: AtomicU8::new(LIFECYCLE_RUNNING),
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            content_length: AtomicI64::new(-1),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub(crate) fn add_uploaded(&self, n: u64) {
        self.bytes_uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_downloaded(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    /// Pre-seed the downloaded counter when resuming a partial file.
    pub(crate) fn set_downloaded(&self, n: u64) {
        self.bytes_downloaded.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_content_length(&self, n: i64) {
        self.content_length.store(n, Ordering::Relaxed);
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_DONE => Lifecycle::Done,
            LIFECYCLE_ERROR => Lifecycle::Error,
            _ => Lifecycle::Running,
        }
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress {
            uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            total: self.content_length.load(Ordering::Relaxed),
        }
    }

    /// Publish the terminal outcome. The outcome is written under the lock
    /// before the release store of the lifecycle word, so an observer that
    /// sees a terminal lifecycle also sees every field.
    pub(crate) fn finish(&self, outcome: Outcome) {
        let terminal = if outcome.error.is_some() {
            LIFECYCLE_ERROR
        } else {
            LIFECYCLE_DONE
        };
        let mut slot = self.outcome.lock().unwrap();
        *slot = Some(outcome);
        self.lifecycle.store(terminal, Ordering::Release);
        self.done.notify_all();
    }

    /// Block until the worker published its terminal state, then take it.
    pub(crate) fn wait_outcome(&self) -> Outcome {
        let mut slot = self.outcome.lock().unwrap();
        while self.lifecycle.load(Ordering::Acquire) == LIFECYCLE_RUNNING {
            slot = self.done.wait(slot).unwrap();
        }
        slot.take().expect("request outcome already taken")
    }
}

/// Handle to a running request. Poll with `is_done`, watch `progress`, and
/// collect the result with `wait`.
pub struct RequestHandle {
    pub(crate) shared: std::sync::Arc<Shared>,
}

impl RequestHandle {
    /// Non-blocking: has the request reached a terminal state?
    pub fn is_done(&self) -> bool {
        self.shared.lifecycle() != Lifecycle::Running
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// Lock-free snapshot of the byte counters.
    pub fn progress(&self) -> Progress {
        self.shared.progress()
    }

    /// Block until the request is terminal and take its result.
    pub fn wait(self) -> RequestResult {
        let outcome = self.shared.wait_outcome();
        RequestResult {
            status: outcome.status,
            headers: parse_headers_map(&outcome.raw_headers),
            body: outcome.body,
            error: outcome.error,
        }
    }
}

/// Final state of a request.
#[derive(Debug)]
pub struct RequestResult {
    /// 0 when the request failed before a status line was read.
    pub status: u16,
    /// Response headers with lowercased names; a repeated name keeps the
    /// last value.
    pub headers: HashMap<String, String>,
    /// Body bytes, or None when the body was streamed to the output file.
    pub body: Option<Vec<u8>>,
    pub error: Option<HttpError>,
}

/// Lowercased name -> value map from the raw header lines.
fn parse_headers_map(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in raw.split('\n') {
        if let Some(colon) = line.find(':') {
            let name = line[..colon].to_ascii_lowercase();
            let value = line[colon + 1..].trim_start_matches(' ');
            map.insert(name, value.to_string());
        }
    }
    map
}

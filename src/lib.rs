/*
 * lib.rs
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

//! Staffetta: a lightweight asynchronous HTTP/1.1 client with transparent
//! TLS, built to be embedded in a larger application that drives requests
//! externally.
//!
//! Each submitted request runs on its own worker task; the caller polls the
//! returned handle for completion, watches lock-free progress counters, and
//! collects the result when the request is terminal. One request per
//! connection (`Connection: close`); redirects are followed up to 10 hops;
//! a response body can be streamed to a file and resumed with a Range
//! request. TLS uses the native Secure Channel record layer on Windows and
//! a dlopen'd OpenSSL everywhere else, so there is no link-time TLS
//! dependency.
//!
//! ```no_run
//! let handle = staffetta::submit(
//!     staffetta::HttpRequest::new("https://example.test/data")
//!         .header("Accept", "*/*"),
//! );
//! let result = handle.wait();
//! assert_eq!(result.status, 200);
//! ```

mod connection;
mod error;
mod executor;
mod h1;
mod request;
mod runtime;
mod tls;
mod url;

use std::sync::Arc;

use request::{Outcome, Shared};

pub use error::HttpError;
pub use request::{HttpRequest, Lifecycle, Progress, RequestHandle, RequestResult};
pub use url::ParsedUrl;

/// Start a request on the process-wide worker runtime and return its
/// handle. The task runs to completion; there is no cancellation.
pub fn submit(request: HttpRequest) -> RequestHandle {
    let shared = Arc::new(Shared::new());
    match runtime::handle() {
        Ok(handle) => {
            let task_shared = shared.clone();
            handle.spawn(executor::run(request, task_shared));
        }
        Err(e) => {
            shared.finish(Outcome {
                status: 0,
                raw_headers: String::new(),
                body: None,
                error: Some(HttpError::Connect(format!(
                    "worker runtime start failed: {}",
                    e
                ))),
            });
        }
    }
    RequestHandle { shared }
}

/// Probe whether a TLS backend can be initialized on this platform.
pub fn tls_available() -> bool {
    tls::available()
}

/// Process-wide teardown: drop the worker runtime and release TLS backend
/// state (library handles, credentials). Call once, after every request has
/// reached a terminal state.
pub fn shutdown() {
    runtime::shutdown();
    tls::unload();
}

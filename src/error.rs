/*
 * error.rs
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

//! Request errors. Every failure path of a request collapses into one of
//! these kinds plus a message; the message is what the consumer sees.

use std::fmt;

/// Terminal error for a request. The variant is the failure kind, the
/// payload is the human-readable message stored on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// URL did not start with `http://`/`https://` or overflowed a field.
    InvalidUrl(String),
    /// Secure scheme requested but no TLS backend could be loaded.
    TlsUnavailable(String),
    /// Name resolution failed.
    Resolve(String),
    /// Every resolved address refused or timed out.
    Connect(String),
    /// TLS handshake failed; backend-specific status is in the message.
    Handshake(String),
    /// Short write or error while transmitting the request.
    Send(String),
    /// EOF or error while reading status line, headers, or body.
    Receive(String),
    /// Output file could not be opened.
    FileOpen(String),
    /// Output file write was short or errored.
    FileWrite(String),
    /// Redirect loop exhausted (10 hops).
    TooManyRedirects,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::InvalidUrl(m)
            | HttpError::TlsUnavailable(m)
            | HttpError::Resolve(m)
            | HttpError::Connect(m)
            | HttpError::Handshake(m)
            | HttpError::Send(m)
            | HttpError::Receive(m)
            | HttpError::FileOpen(m)
            | HttpError::FileWrite(m) => write!(f, "{}", m),
            HttpError::TooManyRedirects => write!(f, "too many redirects (max 10)"),
        }
    }
}

impl std::error::Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_message() {
        let e = HttpError::Connect("connect(example.test:80) failed: refused".to_string());
        assert_eq!(e.to_string(), "connect(example.test:80) failed: refused");
    }

    #[test]
    fn redirect_overflow_message() {
        assert_eq!(
            HttpError::TooManyRedirects.to_string(),
            "too many redirects (max 10)"
        );
    }
}

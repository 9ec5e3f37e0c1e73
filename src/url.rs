/*
 * url.rs
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

//! URL parsing for `http(s)://host[:port]/path`. No percent-decoding, no
//! userinfo; query and fragment stay in the path verbatim.

use crate::error::HttpError;

const MAX_HOST: usize = 255;
const MAX_PORT: usize = 7;

/// A parsed request URL. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub secure: bool,
    pub host: String,
    /// Port kept as a string, the form name resolution wants it in.
    pub port: String,
    pub path: String,
}

impl ParsedUrl {
    /// Parse an absolute http/https URL. Any other scheme fails, as does a
    /// host longer than 255 bytes or a port longer than 7.
    pub fn parse(url: &str) -> Result<ParsedUrl, HttpError> {
        let (secure, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(HttpError::InvalidUrl(format!("invalid URL: {}", url)));
        };

        let slash = rest.find('/');
        let colon = match (rest.find(':'), slash) {
            // A colon after the first slash belongs to the path.
            (Some(c), Some(s)) if c > s => None,
            (c, _) => c,
        };

        let (host, port) = match colon {
            Some(c) => {
                let port_end = slash.unwrap_or(rest.len());
                (&rest[..c], &rest[c + 1..port_end])
            }
            None => {
                let host_end = slash.unwrap_or(rest.len());
                (&rest[..host_end], if secure { "443" } else { "80" })
            }
        };
        if host.len() > MAX_HOST || port.len() > MAX_PORT {
            return Err(HttpError::InvalidUrl(format!("invalid URL: {}", url)));
        }

        let path = match slash {
            Some(s) => &rest[s..],
            None => "/",
        };

        Ok(ParsedUrl {
            secure,
            host: host.to_string(),
            port: port.to_string(),
            path: path.to_string(),
        })
    }

    /// True when the port is the default for the scheme.
    pub fn is_default_port(&self) -> bool {
        self.port == if self.secure { "443" } else { "80" }
    }

    /// Scheme and authority, with the port only when non-default. Used to
    /// resolve path-only `Location` headers.
    pub fn origin(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        if self.is_default_port() {
            format!("{}://{}", scheme, self.host)
        } else {
            format!("{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_host() {
        let u = ParsedUrl::parse("http://example.test").unwrap();
        assert!(!u.secure);
        assert_eq!(u.host, "example.test");
        assert_eq!(u.port, "80");
        assert_eq!(u.path, "/");
    }

    #[test]
    fn https_default_port() {
        let u = ParsedUrl::parse("https://example.test/x").unwrap();
        assert!(u.secure);
        assert_eq!(u.port, "443");
        assert_eq!(u.path, "/x");
    }

    #[test]
    fn explicit_port() {
        let u = ParsedUrl::parse("http://example.test:8080/a/b").unwrap();
        assert_eq!(u.host, "example.test");
        assert_eq!(u.port, "8080");
        assert_eq!(u.path, "/a/b");
    }

    #[test]
    fn port_without_path() {
        let u = ParsedUrl::parse("http://example.test:81").unwrap();
        assert_eq!(u.port, "81");
        assert_eq!(u.path, "/");
    }

    #[test]
    fn colon_in_path_is_not_a_port() {
        let u = ParsedUrl::parse("http://example.test/a:b").unwrap();
        assert_eq!(u.host, "example.test");
        assert_eq!(u.port, "80");
        assert_eq!(u.path, "/a:b");
    }

    #[test]
    fn query_stays_in_path() {
        let u = ParsedUrl::parse("http://example.test/q?a=1#f").unwrap();
        assert_eq!(u.path, "/q?a=1#f");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(ParsedUrl::parse("ftp://example.test/").is_err());
        assert!(ParsedUrl::parse("example.test").is_err());
        assert!(ParsedUrl::parse("").is_err());
    }

    #[test]
    fn rejects_oversized_fields() {
        let long_host = format!("http://{}/", "a".repeat(256));
        assert!(ParsedUrl::parse(&long_host).is_err());
        assert!(ParsedUrl::parse("http://h:12345678/").is_err());
    }

    #[test]
    fn rebuild_parses_back_equivalently() {
        for url in [
            "http://example.test/",
            "https://example.test/path?q=1",
            "http://example.test:8080/p",
            "https://example.test:444/",
        ] {
            let u = ParsedUrl::parse(url).unwrap();
            let rebuilt = format!("{}{}", u.origin(), u.path);
            assert_eq!(ParsedUrl::parse(&rebuilt).unwrap(), u);
        }
    }
}

/*
 * mod.rs
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

//! TLS transport, one record-layer backend per build target: native Secure
//! Channel on Windows, dlopen'd OpenSSL elsewhere. The backend exposes
//! handshake/send/recv/close over the connection's socket; everything else
//! in the crate talks to `TlsSession` only.

#[cfg(unix)]
mod openssl;
#[cfg(unix)]
pub(crate) use openssl::TlsSession;

#[cfg(windows)]
mod schannel;
#[cfg(windows)]
pub(crate) use schannel::TlsSession;

/// Probe the platform backend; the error is the load failure message.
pub(crate) fn ensure() -> Result<(), String> {
    #[cfg(unix)]
    {
        openssl::ensure()
    }
    #[cfg(windows)]
    {
        schannel::ensure()
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err("HTTPS not available on this platform".to_string())
    }
}

/// Probe whether a TLS backend can be initialized on this platform.
pub(crate) fn available() -> bool {
    ensure().is_ok()
}

/// Release process-wide backend state (library handles, credentials).
/// Callers guarantee no session is alive.
pub(crate) fn unload() {
    #[cfg(unix)]
    openssl::unload();
    #[cfg(windows)]
    schannel::unload();
}

/// Decrypted bytes produced by one decryption call but not yet consumed by
/// the caller. Drained before any further decryption.
#[derive(Debug)]
#[cfg(any(windows, test))]
pub(crate) struct Spill {
    data: Vec<u8>,
    offset: usize,
}

#[cfg(any(windows, test))]
impl Spill {
    pub(crate) fn new(data: Vec<u8>) -> Spill {
        Spill { data, offset: 0 }
    }

    /// Copy buffered plaintext into `out`, advancing the offset. Returns the
    /// number of bytes copied and whether the spill is now exhausted.
    pub(crate) fn drain(&mut self, out: &mut [u8]) -> (usize, bool) {
        let avail = self.data.len() - self.offset;
        let n = avail.min(out.len());
        out[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        (n, self.offset >= self.data.len())
    }
}

/// Keep only the trailing `extra` bytes of `buf`, moved to the front. This
/// is how the encrypted input buffer shrinks: decryption reports how many
/// trailing bytes belong to the next record.
#[cfg(any(windows, test))]
pub(crate) fn compact_front(buf: &mut Vec<u8>, extra: usize) {
    let keep_from = buf.len() - extra;
    buf.copy_within(keep_from.., 0);
    buf.truncate(extra);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_drains_in_pieces() {
        let mut spill = Spill::new(b"abcdef".to_vec());
        let mut out = [0u8; 4];
        let (n, done) = spill.drain(&mut out);
        assert_eq!((n, done), (4, false));
        assert_eq!(&out[..n], b"abcd");
        let (n, done) = spill.drain(&mut out);
        assert_eq!((n, done), (2, true));
        assert_eq!(&out[..n], b"ef");
    }

    #[test]
    fn spill_larger_target_drains_at_once() {
        let mut spill = Spill::new(b"xy".to_vec());
        let mut out = [0u8; 16];
        let (n, done) = spill.drain(&mut out);
        assert_eq!((n, done), (2, true));
    }

    #[test]
    fn compact_keeps_trailing_bytes() {
        let mut buf = b"consumedEXTRA".to_vec();
        compact_front(&mut buf, 5);
        assert_eq!(buf, b"EXTRA");
    }

    #[test]
    fn compact_whole_buffer_is_identity() {
        let mut buf = b"abc".to_vec();
        compact_front(&mut buf, 3);
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn compact_zero_clears() {
        let mut buf = b"abc".to_vec();
        compact_front(&mut buf, 0);
        assert!(buf.is_empty());
    }
}

/*
 * openssl.rs
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

//! OpenSSL backend, resolved at runtime with dlopen/dlsym so the crate has
//! no link-time OpenSSL dependency. Versioned library names are probed
//! first; a missing required symbol makes TLS unavailable rather than
//! failing the build. The tokio socket is nonblocking, so every libssl call
//! is driven through a readiness loop (WANT_READ/WANT_WRITE -> await the
//! socket, retry).

use std::ffi::{c_char, c_int, c_long, c_void, CString};
use std::io;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::Mutex;

use log::{debug, warn};
use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::error::HttpError;

const SSL_CTRL_SET_TLSEXT_HOSTNAME: c_int = 55;
const TLSEXT_NAMETYPE_HOST_NAME: c_long = 0;

const SSL_ERROR_WANT_READ: c_int = 2;
const SSL_ERROR_WANT_WRITE: c_int = 3;
const SSL_ERROR_SYSCALL: c_int = 5;
const SSL_ERROR_ZERO_RETURN: c_int = 6;

#[cfg(target_os = "macos")]
const CRYPTO_NAMES: &[&str] = &[
    "libcrypto.so.3",
    "libcrypto.so.1.1",
    "libcrypto.so",
    "libcrypto.3.dylib",
    "libcrypto.1.1.dylib",
    "libcrypto.dylib",
];
#[cfg(target_os = "macos")]
const SSL_NAMES: &[&str] = &[
    "libssl.so.3",
    "libssl.so.1.1",
    "libssl.so",
    "libssl.3.dylib",
    "libssl.1.1.dylib",
    "libssl.dylib",
];

#[cfg(not(target_os = "macos"))]
const CRYPTO_NAMES: &[&str] = &["libcrypto.so.3", "libcrypto.so.1.1", "libcrypto.so"];
#[cfg(not(target_os = "macos"))]
const SSL_NAMES: &[&str] = &["libssl.so.3", "libssl.so.1.1", "libssl.so"];

/// Opaque library pointer. The sessions and handles it names are used by
/// one task at a time, so moving it between worker threads is sound; the
/// wrapper exists because request futures hold these across await points.
#[derive(Clone, Copy, Debug)]
struct RawPtr(*mut c_void);

unsafe impl Send for RawPtr {}

type InitSslFn = unsafe extern "C" fn(u64, *const c_void) -> c_int;
type ClientMethodFn = unsafe extern "C" fn() -> *const c_void;
type CtxNewFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
type CtxFreeFn = unsafe extern "C" fn(*mut c_void);
type SslNewFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type SslFreeFn = unsafe extern "C" fn(*mut c_void);
type SetFdFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type ReadFn = unsafe extern "C" fn(*mut c_void, *mut c_void, c_int) -> c_int;
type WriteFn = unsafe extern "C" fn(*mut c_void, *const c_void, c_int) -> c_int;
type ShutdownFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type CtrlFn = unsafe extern "C" fn(*mut c_void, c_int, c_long, *mut c_void) -> c_long;
type GetErrorFn = unsafe extern "C" fn(*const c_void, c_int) -> c_int;

/// Resolved libssl entry points. All of them are required; a partial load
/// reports TLS unavailable.
#[derive(Clone, Copy, Debug)]
struct Api {
    init_ssl: InitSslFn,
    client_method: ClientMethodFn,
    ctx_new: CtxNewFn,
    ctx_free: CtxFreeFn,
    ssl_new: SslNewFn,
    ssl_free: SslFreeFn,
    set_fd: SetFdFn,
    connect: ConnectFn,
    read: ReadFn,
    write: WriteFn,
    shutdown: ShutdownFn,
    ctrl: CtrlFn,
    get_error: GetErrorFn,
}

struct Loaded {
    api: Api,
    handle_ssl: RawPtr,
    handle_crypto: RawPtr,
}

enum BackendState {
    Unprobed,
    Unavailable(String),
    Loaded(Loaded),
}

static STATE: Mutex<BackendState> = Mutex::new(BackendState::Unprobed);

/// One-shot idempotent load of libssl + libcrypto.
fn load() -> Result<Api, String> {
    let mut state = STATE.lock().unwrap();
    match &*state {
        BackendState::Loaded(loaded) => Ok(loaded.api),
        BackendState::Unavailable(msg) => Err(msg.clone()),
        BackendState::Unprobed => match probe() {
            Ok(loaded) => {
                let api = loaded.api;
                *state = BackendState::Loaded(loaded);
                debug!("OpenSSL backend loaded");
                Ok(api)
            }
            Err(msg) => {
                warn!("{}", msg);
                *state = BackendState::Unavailable(msg.clone());
                Err(msg)
            }
        },
    }
}

pub(crate) fn ensure() -> Result<(), String> {
    load().map(|_| ())
}

/// Drop the library handles. Callers guarantee no session is alive.
pub(crate) fn unload() {
    let mut state = STATE.lock().unwrap();
    if let BackendState::Loaded(loaded) = &*state {
        unsafe {
            libc::dlclose(loaded.handle_ssl.0);
            libc::dlclose(loaded.handle_crypto.0);
        }
        *state = BackendState::Unprobed;
    }
}

fn dlopen_first(names: &[&str]) -> Option<*mut c_void> {
    for name in names {
        if let Ok(cname) = CString::new(*name) {
            let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                return Some(handle);
            }
        }
    }
    None
}

macro_rules! sym {
    ($handle:expr, $name:literal, $ty:ty) => {{
        let ptr = unsafe { libc::dlsym($handle, concat!($name, "\0").as_ptr() as *const c_char) };
        if ptr.is_null() {
            return None;
        }
        unsafe { std::mem::transmute::<*mut c_void, $ty>(ptr) }
    }};
}

fn resolve(handle: *mut c_void) -> Option<Api> {
    Some(Api {
        init_ssl: sym!(handle, "OPENSSL_init_ssl", InitSslFn),
        client_method: sym!(handle, "TLS_client_method", ClientMethodFn),
        ctx_new: sym!(handle, "SSL_CTX_new", CtxNewFn),
        ctx_free: sym!(handle, "SSL_CTX_free", CtxFreeFn),
        ssl_new: sym!(handle, "SSL_new", SslNewFn),
        ssl_free: sym!(handle, "SSL_free", SslFreeFn),
        set_fd: sym!(handle, "SSL_set_fd", SetFdFn),
        connect: sym!(handle, "SSL_connect", ConnectFn),
        read: sym!(handle, "SSL_read", ReadFn),
        write: sym!(handle, "SSL_write", WriteFn),
        shutdown: sym!(handle, "SSL_shutdown", ShutdownFn),
        ctrl: sym!(handle, "SSL_ctrl", CtrlFn),
        get_error: sym!(handle, "SSL_get_error", GetErrorFn),
    })
}

fn probe() -> Result<Loaded, String> {
    let handle_crypto = match dlopen_first(CRYPTO_NAMES) {
        Some(h) => h,
        None => return Err("TLS not available (libcrypto not found)".to_string()),
    };
    let handle_ssl = match dlopen_first(SSL_NAMES) {
        Some(h) => h,
        None => {
            unsafe { libc::dlclose(handle_crypto) };
            return Err("TLS not available (libssl not found)".to_string());
        }
    };
    match resolve(handle_ssl) {
        Some(api) => {
            unsafe { (api.init_ssl)(0, ptr::null()) };
            Ok(Loaded {
                api,
                handle_ssl: RawPtr(handle_ssl),
                handle_crypto: RawPtr(handle_crypto),
            })
        }
        None => {
            unsafe {
                libc::dlclose(handle_ssl);
                libc::dlclose(handle_crypto);
            }
            Err("TLS not available (missing OpenSSL symbols)".to_string())
        }
    }
}

/// Run one libssl call against a nonblocking socket until it completes.
/// WANT_READ/WANT_WRITE clear the polled readiness (via try_io) and await
/// the socket; ZERO_RETURN is the peer's close_notify.
async fn ssl_io<F>(
    api: Api,
    ssl: RawPtr,
    stream: &TcpStream,
    mut interest: Interest,
    mut op: F,
) -> io::Result<c_int>
where
    F: FnMut() -> c_int,
{
    loop {
        let mut want = interest;
        let res = stream.try_io(interest, || {
            let ret = op();
            if ret > 0 {
                return Ok(ret);
            }
            match unsafe { (api.get_error)(ssl.0, ret) } {
                SSL_ERROR_WANT_READ => {
                    want = Interest::READABLE;
                    Err(io::ErrorKind::WouldBlock.into())
                }
                SSL_ERROR_WANT_WRITE => {
                    want = Interest::WRITABLE;
                    Err(io::ErrorKind::WouldBlock.into())
                }
                SSL_ERROR_ZERO_RETURN => Ok(0),
                // Peer closed without close_notify; treat like EOF.
                SSL_ERROR_SYSCALL if ret == 0 => Ok(0),
                code => Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("SSL error {}", code),
                )),
            }
        });
        match res {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                interest = want;
                stream.ready(interest).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One TLS session over one socket: an SSL_CTX plus an SSL bound to the
/// socket fd.
#[derive(Debug)]
pub(crate) struct TlsSession {
    api: Api,
    ssl: RawPtr,
    ctx: RawPtr,
}

impl TlsSession {
    pub(crate) async fn handshake(
        stream: &mut TcpStream,
        hostname: &str,
    ) -> Result<TlsSession, HttpError> {
        let api = load().map_err(HttpError::TlsUnavailable)?;

        let ctx = unsafe { (api.ctx_new)((api.client_method)()) };
        if ctx.is_null() {
            return Err(HttpError::Handshake("TLS context creation failed".to_string()));
        }
        let ssl = unsafe { (api.ssl_new)(ctx) };
        if ssl.is_null() {
            unsafe { (api.ctx_free)(ctx) };
            return Err(HttpError::Handshake("TLS session creation failed".to_string()));
        }
        let mut session = TlsSession {
            api,
            ssl: RawPtr(ssl),
            ctx: RawPtr(ctx),
        };

        unsafe { (api.set_fd)(ssl, stream.as_raw_fd()) };

        // SNI, so virtual-hosted servers pick the right certificate.
        if let Ok(name) = CString::new(hostname) {
            unsafe {
                (api.ctrl)(
                    ssl,
                    SSL_CTRL_SET_TLSEXT_HOSTNAME,
                    TLSEXT_NAMETYPE_HOST_NAME,
                    name.as_ptr() as *mut c_void,
                );
            }
        }

        let ssl_ptr = session.ssl;
        match ssl_io(api, ssl_ptr, stream, Interest::WRITABLE, move || {
            let ssl_ptr = ssl_ptr;
            unsafe { (api.connect)(ssl_ptr.0) }
        })
        .await
        {
            Ok(n) if n > 0 => Ok(session),
            Ok(_) => {
                session.free();
                Err(HttpError::Handshake(
                    "TLS handshake failed: connection closed".to_string(),
                ))
            }
            Err(e) => {
                session.free();
                Err(HttpError::Handshake(format!("TLS handshake failed: {}", e)))
            }
        }
    }

    pub(crate) async fn send(&mut self, stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let api = self.api;
        let ssl = self.ssl;
        let len = data.len().min(c_int::MAX as usize) as c_int;
        let buf = RawPtr(data.as_ptr() as *mut c_void);
        let n = ssl_io(api, ssl, stream, Interest::WRITABLE, move || {
            let (ssl, buf) = (ssl, buf);
            unsafe { (api.write)(ssl.0, buf.0 as *const c_void, len) }
        })
        .await?;
        Ok(n as usize)
    }

    pub(crate) async fn recv(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let api = self.api;
        let ssl = self.ssl;
        let len = buf.len().min(c_int::MAX as usize) as c_int;
        let out = RawPtr(buf.as_mut_ptr() as *mut c_void);
        let n = ssl_io(api, ssl, stream, Interest::READABLE, move || {
            let (ssl, out) = (ssl, out);
            unsafe { (api.read)(ssl.0, out.0, len) }
        })
        .await?;
        Ok(n as usize)
    }

    pub(crate) async fn close(&mut self, _stream: &mut TcpStream) {
        if !self.ssl.0.is_null() {
            // Best-effort close_notify; the socket is closed right after.
            unsafe { (self.api.shutdown)(self.ssl.0) };
        }
        self.free();
    }

    fn free(&mut self) {
        if !self.ssl.0.is_null() {
            unsafe { (self.api.ssl_free)(self.ssl.0) };
            self.ssl = RawPtr(ptr::null_mut());
        }
        if !self.ctx.0.is_null() {
            unsafe { (self.api.ctx_free)(self.ctx.0) };
            self.ctx = RawPtr(ptr::null_mut());
        }
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_idempotent() {
        // Whatever the host has installed, two probes must agree and the
        // gate must not flip between them.
        let first = ensure().is_ok();
        let second = ensure().is_ok();
        assert_eq!(first, second);
    }

    #[test]
    fn versioned_names_probe_first() {
        assert!(SSL_NAMES[0].contains(".so.3") || SSL_NAMES[0].contains(".3.dylib"));
        assert!(CRYPTO_NAMES.len() >= 3);
    }
}

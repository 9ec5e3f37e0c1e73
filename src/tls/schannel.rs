/*
 * schannel.rs
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

//! Secure Channel backend: the native Windows record layer, no external
//! library. One process-wide credentials handle; per-session context plus
//! the two record buffers (encrypted input, plaintext spill).
//!
//! DecryptMessage works in place: the plaintext DATA segment and the EXTRA
//! segment both point into the encrypted input buffer. Plaintext is copied
//! out before the EXTRA bytes are compacted to the front; reversing that
//! order corrupts the stream. The SSPI buffer descriptors never cross an
//! await point; each call is a synchronous step between socket reads and
//! writes.

use std::ffi::{c_void, CString};
use std::io;
use std::mem;
use std::ptr;
use std::sync::Mutex;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use windows_sys::Win32::Foundation::{
    SEC_E_INCOMPLETE_MESSAGE, SEC_E_OK, SEC_I_CONTEXT_EXPIRED, SEC_I_CONTINUE_NEEDED,
};
use windows_sys::Win32::Security::Authentication::Identity::{
    AcquireCredentialsHandleA, DecryptMessage, DeleteSecurityContext, EncryptMessage,
    FreeContextBuffer, FreeCredentialsHandle, InitializeSecurityContextA, QueryContextAttributesA,
    SecBuffer, SecBufferDesc, SecPkgContext_StreamSizes, ISC_REQ_ALLOCATE_MEMORY,
    ISC_REQ_CONFIDENTIALITY, ISC_REQ_INTEGRITY, ISC_REQ_MANUAL_CRED_VALIDATION,
    ISC_REQ_SEQUENCE_DETECT, ISC_REQ_STREAM, SCHANNEL_CRED, SCHANNEL_CRED_VERSION,
    SCH_CRED_MANUAL_CRED_VALIDATION, SCH_USE_STRONG_CRYPTO, SECBUFFER_DATA, SECBUFFER_EMPTY,
    SECBUFFER_EXTRA, SECBUFFER_STREAM_HEADER, SECBUFFER_STREAM_TRAILER, SECBUFFER_TOKEN,
    SECBUFFER_VERSION, SECPKG_ATTR_STREAM_SIZES, SECPKG_CRED_OUTBOUND,
};
use windows_sys::Win32::Security::Credentials::SecHandle;

use super::{compact_front, Spill};
use crate::error::HttpError;

const UNISP_NAME: &[u8] = b"Microsoft Unified Security Protocol Provider\0";
const HANDSHAKE_MAX_ITERATIONS: usize = 100;
const READ_CHUNK: usize = 16384;

enum CredState {
    Uninit,
    Failed(String),
    Ready(SecHandle),
}

static CREDENTIALS: Mutex<CredState> = Mutex::new(CredState::Uninit);

/// Acquire the process-wide outbound credentials handle exactly once.
/// Protocol version auto-negotiated, manual certificate validation.
fn credentials() -> Result<SecHandle, String> {
    let mut state = CREDENTIALS.lock().unwrap();
    match &*state {
        CredState::Ready(handle) => Ok(*handle),
        CredState::Failed(msg) => Err(msg.clone()),
        CredState::Uninit => {
            let mut schannel_cred: SCHANNEL_CRED = unsafe { mem::zeroed() };
            schannel_cred.dwVersion = SCHANNEL_CRED_VERSION;
            // 0 lets Secure Channel auto-negotiate the protocol version.
            schannel_cred.grbitEnabledProtocols = 0;
            schannel_cred.dwFlags = SCH_CRED_MANUAL_CRED_VALIDATION | SCH_USE_STRONG_CRYPTO;

            let mut handle: SecHandle = unsafe { mem::zeroed() };
            let mut expiry: i64 = 0;
            let status = unsafe {
                AcquireCredentialsHandleA(
                    ptr::null(),
                    UNISP_NAME.as_ptr(),
                    SECPKG_CRED_OUTBOUND,
                    ptr::null(),
                    &schannel_cred as *const SCHANNEL_CRED as *const c_void,
                    None,
                    ptr::null(),
                    &mut handle,
                    &mut expiry,
                )
            };
            if status != SEC_E_OK {
                let msg = format!("AcquireCredentialsHandle failed: 0x{:x}", status as u32);
                *state = CredState::Failed(msg.clone());
                Err(msg)
            } else {
                *state = CredState::Ready(handle);
                Ok(handle)
            }
        }
    }
}

pub(crate) fn ensure() -> Result<(), String> {
    credentials().map(|_| ())
}

/// Release the credentials handle. Callers guarantee no session is alive.
pub(crate) fn unload() {
    let mut state = CREDENTIALS.lock().unwrap();
    if let CredState::Ready(handle) = &*state {
        unsafe { FreeCredentialsHandle(handle) };
        *state = CredState::Uninit;
    }
}

fn handle_is_set(h: &SecHandle) -> bool {
    h.dwLower != 0 || h.dwUpper != 0
}

/// One InitializeSecurityContext round: the accumulated bytes go in, a
/// token to transmit and the count of unconsumed trailing bytes come out.
struct IscStep {
    status: i32,
    token: Vec<u8>,
    extra: usize,
}

fn isc_step(
    cred: &SecHandle,
    ctx: &mut SecHandle,
    host: &CString,
    initial: bool,
    recv_buf: &mut [u8],
) -> IscStep {
    let context_req = ISC_REQ_SEQUENCE_DETECT
        | ISC_REQ_CONFIDENTIALITY
        | ISC_REQ_INTEGRITY
        | ISC_REQ_STREAM
        | ISC_REQ_ALLOCATE_MEMORY
        | ISC_REQ_MANUAL_CRED_VALIDATION;

    let mut in_buffers = [
        SecBuffer {
            cbBuffer: recv_buf.len() as u32,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: recv_buf.as_mut_ptr() as *mut c_void,
        },
        SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_EMPTY,
            pvBuffer: ptr::null_mut(),
        },
    ];
    let in_desc = SecBufferDesc {
        ulVersion: SECBUFFER_VERSION,
        cBuffers: 2,
        pBuffers: in_buffers.as_mut_ptr(),
    };
    let mut out_buffers = [SecBuffer {
        cbBuffer: 0,
        BufferType: SECBUFFER_TOKEN,
        pvBuffer: ptr::null_mut(),
    }];
    let mut out_desc = SecBufferDesc {
        ulVersion: SECBUFFER_VERSION,
        cBuffers: 1,
        pBuffers: out_buffers.as_mut_ptr(),
    };
    let mut attrs: u32 = 0;
    let mut expiry: i64 = 0;

    let status = unsafe {
        InitializeSecurityContextA(
            cred,
            if initial { ptr::null() } else { ctx },
            host.as_ptr() as *const u8,
            context_req,
            0,
            0,
            if initial { ptr::null() } else { &in_desc },
            0,
            if initial { ctx } else { ptr::null_mut() },
            &mut out_desc,
            &mut attrs,
            &mut expiry,
        )
    };

    let mut token = Vec::new();
    if !out_buffers[0].pvBuffer.is_null() {
        if out_buffers[0].cbBuffer > 0 {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    out_buffers[0].pvBuffer as *const u8,
                    out_buffers[0].cbBuffer as usize,
                )
            };
            token.extend_from_slice(bytes);
        }
        unsafe { FreeContextBuffer(out_buffers[0].pvBuffer) };
    }

    let mut extra = 0usize;
    for b in &in_buffers {
        if b.BufferType == SECBUFFER_EXTRA && b.cbBuffer > 0 {
            extra = b.cbBuffer as usize;
            break;
        }
    }

    IscStep {
        status,
        token,
        extra,
    }
}

/// Outcome of one DecryptMessage call over the encrypted input buffer.
enum DecryptStep {
    /// `n` plaintext bytes were copied into the caller's buffer.
    Delivered(usize),
    /// An empty record was consumed; decrypt again.
    Again,
    /// Not a whole record yet; read more from the socket.
    NeedMore,
    /// close_notify from the peer.
    Closed,
    Fail(io::Error),
}

/// One TLS session: the security context plus the two record buffers.
#[derive(Debug)]
pub(crate) struct TlsSession {
    ctx: SecHandle,
    /// Raw bytes from the socket not yet decrypted. Grows by appending,
    /// shrinks by compacting the trailing EXTRA bytes to the front.
    enc_in: Vec<u8>,
    /// Decrypted bytes not yet handed to the caller.
    spill: Option<Spill>,
}

impl TlsSession {
    pub(crate) async fn handshake(
        stream: &mut TcpStream,
        hostname: &str,
    ) -> Result<TlsSession, HttpError> {
        let cred = credentials().map_err(HttpError::TlsUnavailable)?;
        let host_c = CString::new(hostname)
            .map_err(|_| HttpError::Handshake("invalid host name".to_string()))?;

        let mut ctx: SecHandle = unsafe { mem::zeroed() };
        let mut recv_buf: Vec<u8> = Vec::new();
        let mut initial = true;

        for iteration in 0..HANDSHAKE_MAX_ITERATIONS {
            let step = isc_step(&cred, &mut ctx, &host_c, initial, &mut recv_buf);
            debug!(
                "schannel handshake iteration {}: status 0x{:08x}",
                iteration, step.status as u32
            );
            initial = false;

            if step.status == SEC_E_OK {
                if !step.token.is_empty() && stream.write_all(&step.token).await.is_err() {
                    delete_context(&mut ctx);
                    return Err(HttpError::Handshake(
                        "failed to send final TLS handshake token".to_string(),
                    ));
                }
                // The server may have sent application data right behind
                // the final handshake record; it seeds the encrypted input.
                let mut enc_in = Vec::new();
                if step.extra > 0 {
                    enc_in.extend_from_slice(&recv_buf[recv_buf.len() - step.extra..]);
                }
                return Ok(TlsSession {
                    ctx,
                    enc_in,
                    spill: None,
                });
            } else if step.status == SEC_I_CONTINUE_NEEDED {
                if !step.token.is_empty() && stream.write_all(&step.token).await.is_err() {
                    delete_context(&mut ctx);
                    return Err(HttpError::Handshake(
                        "failed to send TLS handshake token".to_string(),
                    ));
                }
                if step.extra > 0 {
                    // Unconsumed bytes already hold the next token.
                    compact_front(&mut recv_buf, step.extra);
                } else {
                    recv_buf.clear();
                    match read_append(stream, &mut recv_buf).await {
                        Ok(n) if n > 0 => {}
                        _ => {
                            delete_context(&mut ctx);
                            return Err(HttpError::Handshake(
                                "failed to receive TLS handshake response".to_string(),
                            ));
                        }
                    }
                }
            } else if step.status == SEC_E_INCOMPLETE_MESSAGE {
                // Nothing was consumed; the whole buffer stays, more bytes
                // are appended behind it.
                match read_append(stream, &mut recv_buf).await {
                    Ok(n) if n > 0 => {}
                    _ => {
                        delete_context(&mut ctx);
                        return Err(HttpError::Handshake(
                            "failed to receive TLS handshake response".to_string(),
                        ));
                    }
                }
            } else {
                delete_context(&mut ctx);
                return Err(HttpError::Handshake(format!(
                    "TLS handshake failed: 0x{:x}",
                    step.status as u32
                )));
            }
        }

        delete_context(&mut ctx);
        Err(HttpError::Handshake(
            "TLS handshake timeout (too many iterations)".to_string(),
        ))
    }

    /// Encrypt one record in place (header + plaintext + trailer) and
    /// return it with the plaintext length it carries.
    fn encrypt_record(&mut self, data: &[u8]) -> io::Result<(Vec<u8>, usize)> {
        let mut sizes: SecPkgContext_StreamSizes = unsafe { mem::zeroed() };
        let status = unsafe {
            QueryContextAttributesA(
                &self.ctx,
                SECPKG_ATTR_STREAM_SIZES,
                &mut sizes as *mut SecPkgContext_StreamSizes as *mut c_void,
            )
        };
        if status != SEC_E_OK {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("QueryContextAttributes failed: 0x{:x}", status as u32),
            ));
        }

        let header = sizes.cbHeader as usize;
        let trailer = sizes.cbTrailer as usize;
        let len = data.len().min(sizes.cbMaximumMessage as usize);

        let mut record = vec![0u8; header + len + trailer];
        record[header..header + len].copy_from_slice(&data[..len]);

        let mut buffers = [
            SecBuffer {
                cbBuffer: header as u32,
                BufferType: SECBUFFER_STREAM_HEADER,
                pvBuffer: record.as_mut_ptr() as *mut c_void,
            },
            SecBuffer {
                cbBuffer: len as u32,
                BufferType: SECBUFFER_DATA,
                pvBuffer: unsafe { record.as_mut_ptr().add(header) } as *mut c_void,
            },
            SecBuffer {
                cbBuffer: trailer as u32,
                BufferType: SECBUFFER_STREAM_TRAILER,
                pvBuffer: unsafe { record.as_mut_ptr().add(header + len) } as *mut c_void,
            },
            SecBuffer {
                cbBuffer: 0,
                BufferType: SECBUFFER_EMPTY,
                pvBuffer: ptr::null_mut(),
            },
        ];
        let mut desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 4,
            pBuffers: buffers.as_mut_ptr(),
        };

        let status = unsafe { EncryptMessage(&self.ctx, 0, &mut desc, 0) };
        if status != SEC_E_OK {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("TLS encrypt failed: 0x{:x}", status as u32),
            ));
        }

        let total = (buffers[0].cbBuffer + buffers[1].cbBuffer + buffers[2].cbBuffer) as usize;
        record.truncate(total);
        Ok((record, len))
    }

    pub(crate) async fn send(&mut self, stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let (record, len) = self.encrypt_record(data)?;
        stream.write_all(&record).await?;
        Ok(len)
    }

    /// One DecryptMessage over the encrypted input. The plaintext is copied
    /// into `out` (and spilled) before the EXTRA segment is compacted, as
    /// both alias the same backing buffer.
    fn decrypt_step(&mut self, out: &mut [u8]) -> DecryptStep {
        let mut buffers = [
            SecBuffer {
                cbBuffer: self.enc_in.len() as u32,
                BufferType: SECBUFFER_DATA,
                pvBuffer: self.enc_in.as_mut_ptr() as *mut c_void,
            },
            SecBuffer {
                cbBuffer: 0,
                BufferType: SECBUFFER_EMPTY,
                pvBuffer: ptr::null_mut(),
            },
            SecBuffer {
                cbBuffer: 0,
                BufferType: SECBUFFER_EMPTY,
                pvBuffer: ptr::null_mut(),
            },
            SecBuffer {
                cbBuffer: 0,
                BufferType: SECBUFFER_EMPTY,
                pvBuffer: ptr::null_mut(),
            },
        ];
        let mut desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 4,
            pBuffers: buffers.as_mut_ptr(),
        };

        let status = unsafe { DecryptMessage(&self.ctx, &mut desc, 0, ptr::null_mut()) };

        if status == SEC_E_OK {
            let mut plain: Option<(*const u8, usize)> = None;
            let mut extra = 0usize;
            for b in &buffers {
                if b.BufferType == SECBUFFER_DATA && b.cbBuffer > 0 && plain.is_none() {
                    plain = Some((b.pvBuffer as *const u8, b.cbBuffer as usize));
                }
                if b.BufferType == SECBUFFER_EXTRA && b.cbBuffer > 0 && extra == 0 {
                    extra = b.cbBuffer as usize;
                }
            }

            let (plain_ptr, plain_len) = match plain {
                Some(p) => p,
                None => {
                    // Empty record; keep any EXTRA and decrypt again.
                    if extra > 0 {
                        compact_front(&mut self.enc_in, extra);
                    } else {
                        self.enc_in.clear();
                    }
                    return DecryptStep::Again;
                }
            };

            let n = plain_len.min(out.len());
            unsafe {
                let plain_slice = std::slice::from_raw_parts(plain_ptr, plain_len);
                out[..n].copy_from_slice(&plain_slice[..n]);
                if n < plain_len {
                    self.spill = Some(Spill::new(plain_slice[n..].to_vec()));
                }
            }
            if extra > 0 {
                compact_front(&mut self.enc_in, extra);
            } else {
                self.enc_in.clear();
            }
            DecryptStep::Delivered(n)
        } else if status == SEC_E_INCOMPLETE_MESSAGE {
            DecryptStep::NeedMore
        } else if status == SEC_I_CONTEXT_EXPIRED {
            self.enc_in.clear();
            DecryptStep::Closed
        } else {
            DecryptStep::Fail(io::Error::new(
                io::ErrorKind::Other,
                format!("TLS decrypt failed: 0x{:x}", status as u32),
            ))
        }
    }

    pub(crate) async fn recv(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Plaintext left over from the previous record goes out first.
        if let Some(spill) = &mut self.spill {
            let (n, done) = spill.drain(buf);
            if done {
                self.spill = None;
            }
            return Ok(n);
        }

        loop {
            if self.enc_in.is_empty() {
                let n = read_append(stream, &mut self.enc_in).await?;
                if n == 0 {
                    return Ok(0);
                }
            }
            match self.decrypt_step(buf) {
                DecryptStep::Delivered(n) => return Ok(n),
                DecryptStep::Again => continue,
                DecryptStep::NeedMore => {
                    // Keep what we have, append the rest of the record.
                    let n = read_append(stream, &mut self.enc_in).await?;
                    if n == 0 {
                        return Ok(0);
                    }
                }
                DecryptStep::Closed => return Ok(0),
                DecryptStep::Fail(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn close(&mut self, _stream: &mut TcpStream) {
        delete_context(&mut self.ctx);
        self.enc_in = Vec::new();
        self.spill = None;
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        delete_context(&mut self.ctx);
    }
}

fn delete_context(ctx: &mut SecHandle) {
    if handle_is_set(ctx) {
        unsafe { DeleteSecurityContext(ctx) };
        *ctx = unsafe { mem::zeroed() };
    }
}

/// Read up to one chunk from the socket, appending to `buf`.
async fn read_append(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<usize> {
    let mut tmp = [0u8; READ_CHUNK];
    let n = stream.read(&mut tmp).await?;
    buf.extend_from_slice(&tmp[..n]);
    Ok(n)
}

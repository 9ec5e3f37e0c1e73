/*
 * runtime.rs
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

//! Process-wide worker runtime: created lazily on the first submit, torn
//! down once by `shutdown`. Submitting after shutdown starts a fresh one.

use std::io;
use std::sync::Mutex;

use tokio::runtime::{Builder, Handle, Runtime};

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// Handle to the worker runtime, creating it on first use.
pub(crate) fn handle() -> io::Result<Handle> {
    let mut slot = RUNTIME.lock().unwrap();
    if let Some(runtime) = slot.as_ref() {
        return Ok(runtime.handle().clone());
    }
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("staffetta-worker")
        .build()?;
    let handle = runtime.handle().clone();
    *slot = Some(runtime);
    Ok(handle)
}

/// Drop the runtime. Callers guarantee every request reached a terminal
/// state first.
pub(crate) fn shutdown() {
    if let Some(runtime) = RUNTIME.lock().unwrap().take() {
        runtime.shutdown_background();
    }
}

/*
 * lib.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! C FFI for the mailim mailbox: the socket interface only (create, listen,
//! connect, accept, send, recv, shutdown, close, dump, restore), the
//! epoll-like readiness multiplexer, and handshake bundle generation for
//! secure sockets. Mailboxes, sockets, and epolls are opaque `u64` handles
//! scoped to this process. All string parameters are UTF-8 NUL-terminated;
//! buffers handed back to the caller are freed with `mailim_free_bytes`,
//! strings with `mailim_free_string`.

use libc::{c_char, c_int, c_void, size_t};
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mailim_core::mailbox::epoll::EpollContext;
use mailim_core::mailbox::ratchet::RatchetEngine;
use mailim_core::mailbox::transport::{ImapInboundSource, MailCredential, SmtpOutboundSink};
use mailim_core::mailbox::{AcceptDecision, Endpoint, Mailbox, MailboxConfig, MailboxError, SocketHandle};

/// Wrapper so `*mut c_void` can be moved into `Send` closures: the accept
/// callback runs on whatever thread called `mailim_socket_accept`, which may
/// not be the thread that registered `user_data`.
struct SendableUserData(*mut c_void);
unsafe impl Send for SendableUserData {}
unsafe impl Sync for SendableUserData {}

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = std::cell::RefCell::new(None);
}

fn set_last_error_msg(msg: &str) {
    let msg = CString::new(msg).unwrap_or_else(|_| CString::new("(error)").unwrap());
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn set_last_error(err: &MailboxError) {
    set_last_error_msg(&err.to_string());
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

unsafe fn cstr<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

/// A heap-allocated byte buffer handed to the caller; free with
/// `mailim_free_bytes`. `data` is NULL and `len` is 0 on failure.
#[repr(C)]
pub struct MailimBytes {
    pub data: *mut u8,
    pub len: size_t,
}

impl MailimBytes {
    fn empty() -> Self {
        MailimBytes { data: ptr::null_mut(), len: 0 }
    }
}

fn bytes_to_ffi(mut v: Vec<u8>) -> MailimBytes {
    v.shrink_to_fit();
    let data = v.as_mut_ptr();
    let len = v.len();
    std::mem::forget(v);
    MailimBytes { data, len }
}

/// Registry of live mailboxes and their epoll contexts, keyed by opaque
/// handles allocated from a single counter shared across both kinds (a
/// handle is never ambiguous between a mailbox and an epoll).
struct Registry {
    mailboxes: RwLock<HashMap<u64, Arc<Mailbox>>>,
    epolls: RwLock<HashMap<u64, (Arc<Mailbox>, u64)>>,
    counter: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: std::sync::OnceLock<Registry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        mailboxes: RwLock::new(HashMap::new()),
        epolls: RwLock::new(HashMap::new()),
        counter: AtomicU64::new(0),
    })
}

fn next_handle() -> u64 {
    registry().counter.fetch_add(1, Ordering::SeqCst) + 1
}

fn with_mailbox<R>(handle: u64, f: impl FnOnce(&Arc<Mailbox>) -> R) -> Option<R> {
    registry().mailboxes.read().unwrap().get(&handle).map(f)
}

/// Version string (static, do not free).
#[no_mangle]
pub extern "C" fn mailim_version() -> *const c_char {
    b"0.1.0\0".as_ptr() as *const c_char
}

/// Last error message from a failed call on this thread. Valid until the
/// next FFI call on the same thread. Do not free.
#[no_mangle]
pub extern "C" fn mailim_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

/// Free a string returned by this library. No-op if `ptr` is NULL.
#[no_mangle]
pub unsafe extern "C" fn mailim_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

/// Free a buffer returned by this library (e.g. from `mailim_socket_recv`,
/// `mailim_socket_dump`, `mailim_generate_handshake_bundle`). No-op if
/// `data` is NULL.
#[no_mangle]
pub unsafe extern "C" fn mailim_free_bytes(b: MailimBytes) {
    if !b.data.is_null() {
        let _ = Vec::from_raw_parts(b.data, b.len, b.len);
    }
}

/// Open a mailbox backed by one SMTP account (outbound) and one IMAP
/// account (inbound) -- typically the same mail account used both ways.
/// Spawns the scheduler and listener threads; connects to IMAP immediately.
/// Returns 0 on failure (see `mailim_last_error`).
#[no_mangle]
pub unsafe extern "C" fn mailim_mailbox_new(
    host: *const c_char,
    port: u16,
    username: *const c_char,
    password: *const c_char,
    use_implicit_tls: c_int,
    use_starttls: c_int,
    rto_ms: u64,
    ato_ms: u64,
    max_attempts: u32,
    x_mailer: *const c_char,
) -> u64 {
    clear_last_error();
    let (Some(host), Some(username), Some(password)) = (cstr(host), cstr(username), cstr(password)) else {
        set_last_error_msg("host/username/password must be non-NULL valid UTF-8");
        return 0;
    };
    let credential = MailCredential {
        host: host.to_string(),
        port,
        username: username.to_string(),
        password: password.to_string(),
        use_implicit_tls: use_implicit_tls != 0,
        use_starttls: use_starttls != 0,
    };

    let sink: Arc<SmtpOutboundSink> = match SmtpOutboundSink::new(credential.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            set_last_error_msg(&e.to_string());
            return 0;
        }
    };
    let source: Box<ImapInboundSource> = match ImapInboundSource::connect(&credential) {
        Ok(s) => Box::new(s),
        Err(e) => {
            set_last_error_msg(&e.to_string());
            return 0;
        }
    };

    let mut config = MailboxConfig {
        rto_ms,
        ato_ms,
        max_attempts,
        ..MailboxConfig::default()
    };
    if let Some(x) = cstr(x_mailer) {
        config.x_mailer = x.to_string();
    }

    let mailbox = Mailbox::new(sink, source, config);
    let handle = next_handle();
    registry().mailboxes.write().unwrap().insert(handle, mailbox);
    handle
}

/// Close a mailbox: stops its listener/scheduler threads. Any sockets or
/// epolls still open on it become invalid.
#[no_mangle]
pub extern "C" fn mailim_mailbox_close(mailbox: u64) {
    if let Some(m) = registry().mailboxes.write().unwrap().remove(&mailbox) {
        m.close();
    }
}

fn endpoint_from(address: Option<&str>, port: Option<&str>) -> Option<Endpoint> {
    Some(Endpoint::new(address?, port?))
}

/// Create a new, unconnected socket on `mailbox`. Returns 0 on an invalid
/// mailbox handle.
#[no_mangle]
pub extern "C" fn mailim_socket_create(mailbox: u64) -> u64 {
    clear_last_error();
    match with_mailbox(mailbox, |m| m.socket_create().0) {
        Some(sid) => sid,
        None => {
            set_last_error_msg("invalid mailbox handle");
            0
        }
    }
}

/// Bind `sid` as a listening socket on `local_address`/`local_port` (either
/// may be an empty string or, for `local_address`, an `@domain` suffix, for
/// wildcard matching). Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_listen(
    mailbox: u64,
    sid: u64,
    local_address: *const c_char,
    local_port: *const c_char,
) -> c_int {
    clear_last_error();
    let Some(local) = endpoint_from(cstr(local_address), cstr(local_port)) else {
        set_last_error_msg("local_address/local_port must be valid UTF-8");
        return -1;
    };
    match with_mailbox(mailbox, |m| m.socket_listen(SocketHandle(sid), local)) {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            set_last_error(&e);
            -1
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            -1
        }
    }
}

/// Connect `sid` to `remote_address`/`remote_port` from `local_address`/
/// `local_port`. If `handshake_bundle` is non-NULL/non-zero-length, the
/// connection is secured (Double Ratchet) using the peer's published
/// bundle; `timeout_ms` bounds the secure handshake only (a plain connect
/// never blocks on the network -- its SYN rides the first send). A
/// negative `timeout_ms` waits indefinitely. Returns 0 on success, -1 on
/// error.
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_connect(
    mailbox: u64,
    sid: u64,
    local_address: *const c_char,
    local_port: *const c_char,
    remote_address: *const c_char,
    remote_port: *const c_char,
    handshake_bundle: *const u8,
    handshake_bundle_len: size_t,
    timeout_ms: i64,
) -> c_int {
    clear_last_error();
    let (Some(local), Some(remote)) = (
        endpoint_from(cstr(local_address), cstr(local_port)),
        endpoint_from(cstr(remote_address), cstr(remote_port)),
    ) else {
        set_last_error_msg("local/remote address or port must be valid UTF-8");
        return -1;
    };
    let bundle = if handshake_bundle.is_null() || handshake_bundle_len == 0 {
        None
    } else {
        let bytes = std::slice::from_raw_parts(handshake_bundle, handshake_bundle_len);
        match mailim_core::mailbox::ratchet::HandshakeBundle::from_bytes(bytes) {
            Ok(b) => Some(b),
            Err(e) => {
                set_last_error(&e);
                return -1;
            }
        }
    };
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    match with_mailbox(mailbox, |m| m.socket_connect(SocketHandle(sid), local, remote, bundle, timeout)) {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            set_last_error(&e);
            -1
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            -1
        }
    }
}

/// Decision codes returned by `AcceptDecideCallback`.
pub const MAILIM_ACCEPT_REJECT: c_int = 0;
pub const MAILIM_ACCEPT_PLAIN: c_int = 1;
pub const MAILIM_ACCEPT_SECURE: c_int = 2;

/// Called once per pending connection on a listening socket. `secure` is 1
/// if the peer is attempting a secure (Double Ratchet) connection. To
/// return `MAILIM_ACCEPT_SECURE`, the callback must fill both
/// `own_sign_key_out` and `peer_sign_pub_out` (32 bytes each) before
/// returning; for any other decision their contents are ignored.
pub type AcceptDecideCallback = extern "C" fn(
    local_address: *const c_char,
    local_port: *const c_char,
    remote_address: *const c_char,
    remote_port: *const c_char,
    secure: c_int,
    own_sign_key_out: *mut u8,
    peer_sign_pub_out: *mut u8,
    user_data: *mut c_void,
) -> c_int;

/// Wait for and admit one pending connection on listening socket `sid`.
/// `timeout_ms` governs the whole drain (rejects don't reset it); negative
/// waits indefinitely. Returns the new connected socket's handle, or 0 if
/// the timeout elapsed with nothing to accept (not an error) or on
/// failure (see `mailim_last_error`).
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_accept(
    mailbox: u64,
    sid: u64,
    decide: AcceptDecideCallback,
    user_data: *mut c_void,
    timeout_ms: i64,
) -> u64 {
    clear_last_error();
    let user_data = SendableUserData(user_data);
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };

    let result = with_mailbox(mailbox, |m| {
        m.socket_accept(
            SocketHandle(sid),
            |local, remote, secure| {
                let local_address = CString::new(local.address.as_str()).unwrap_or_default();
                let local_port = CString::new(local.port.as_str()).unwrap_or_default();
                let remote_address = CString::new(remote.address.as_str()).unwrap_or_default();
                let remote_port = CString::new(remote.port.as_str()).unwrap_or_default();
                let mut own_sign_key = [0u8; 32];
                let mut peer_sign_pub = [0u8; 32];
                let decision = decide(
                    local_address.as_ptr(),
                    local_port.as_ptr(),
                    remote_address.as_ptr(),
                    remote_port.as_ptr(),
                    if secure { 1 } else { 0 },
                    own_sign_key.as_mut_ptr(),
                    peer_sign_pub.as_mut_ptr(),
                    user_data.0,
                );
                match decision {
                    MAILIM_ACCEPT_PLAIN => AcceptDecision::Accept,
                    MAILIM_ACCEPT_SECURE => AcceptDecision::AcceptSecure { own_sign_key, peer_sign_pub },
                    _ => AcceptDecision::Reject,
                }
            },
            timeout,
        )
    });

    match result {
        Some(Ok(Some(handle))) => handle.0,
        Some(Ok(None)) => 0,
        Some(Err(e)) => {
            set_last_error(&e);
            0
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            0
        }
    }
}

/// Send `len` bytes on connected socket `sid`. Returns the number of bytes
/// accepted (always `len` on success, since the mailbox buffers the whole
/// write), or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_send(mailbox: u64, sid: u64, data: *const u8, len: size_t) -> isize {
    clear_last_error();
    if data.is_null() && len != 0 {
        set_last_error_msg("data is NULL with nonzero len");
        return -1;
    }
    let buf = if len == 0 { &[][..] } else { std::slice::from_raw_parts(data, len) };
    match with_mailbox(mailbox, |m| m.socket_send(SocketHandle(sid), buf)) {
        Some(Ok(n)) => n as isize,
        Some(Err(e)) => {
            set_last_error(&e);
            -1
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            -1
        }
    }
}

/// Receive up to `max_size` bytes on connected socket `sid`, blocking up to
/// `timeout_ms` (negative waits indefinitely) for data to arrive. Returns
/// an empty buffer with `data` non-NULL for a zero-byte successful read;
/// on error, `data` is NULL (check `mailim_last_error`).
#[no_mangle]
pub extern "C" fn mailim_socket_recv(mailbox: u64, sid: u64, max_size: size_t, timeout_ms: i64) -> MailimBytes {
    clear_last_error();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    match with_mailbox(mailbox, |m| m.socket_recv(SocketHandle(sid), max_size, timeout)) {
        Some(Ok(buf)) => bytes_to_ffi(buf),
        Some(Err(e)) => {
            set_last_error(&e);
            MailimBytes::empty()
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            MailimBytes::empty()
        }
    }
}

/// Half-close `sid`: no further sends are accepted but queued data may
/// still be received. Idempotent.
#[no_mangle]
pub extern "C" fn mailim_socket_shutdown(mailbox: u64, sid: u64) {
    let _ = with_mailbox(mailbox, |m| m.socket_shutdown(SocketHandle(sid)));
}

/// Fully close and forget `sid`. Idempotent.
#[no_mangle]
pub extern "C" fn mailim_socket_close(mailbox: u64, sid: u64) {
    let _ = with_mailbox(mailbox, |m| m.socket_close(SocketHandle(sid)));
}

/// Write `sid`'s local and remote endpoints into the caller's buffers
/// (each of size `addr_cap`/`port_cap`, NUL-terminated on success). Returns
/// 0 on success, -1 if `sid` is invalid or not connected/listening, -2 if a
/// buffer was too small.
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_endpoints(
    mailbox: u64,
    sid: u64,
    local_address: *mut c_char,
    local_address_cap: size_t,
    local_port: *mut c_char,
    local_port_cap: size_t,
    remote_address: *mut c_char,
    remote_address_cap: size_t,
    remote_port: *mut c_char,
    remote_port_cap: size_t,
) -> c_int {
    clear_last_error();
    let result = match with_mailbox(mailbox, |m| m.socket_endpoints(SocketHandle(sid))) {
        Some(Ok(r)) => r,
        Some(Err(e)) => {
            set_last_error(&e);
            return -1;
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            return -1;
        }
    };
    let write = |dst: *mut c_char, cap: size_t, value: &str| -> bool {
        if dst.is_null() || cap == 0 {
            return value.is_empty();
        }
        if value.len() + 1 > cap {
            return false;
        }
        ptr::copy_nonoverlapping(value.as_ptr() as *const c_char, dst, value.len());
        *dst.add(value.len()) = 0;
        true
    };
    let (local, remote) = result;
    let local = local.unwrap_or_else(|| Endpoint::new("", ""));
    let remote = remote.unwrap_or_else(|| Endpoint::new("", ""));
    if !write(local_address, local_address_cap, &local.address)
        || !write(local_port, local_port_cap, &local.port)
        || !write(remote_address, remote_address_cap, &remote.address)
        || !write(remote_port, remote_port_cap, &remote.port)
    {
        set_last_error_msg("output buffer too small");
        return -2;
    }
    0
}

/// Serialize connected socket `sid`'s full state (sequence numbers,
/// unacked/unread data, secure-channel ratchet state if any) encrypted
/// under `pickle_key`, for persistence across a process restart. Empty
/// buffer on error.
#[no_mangle]
pub extern "C" fn mailim_socket_dump(mailbox: u64, sid: u64, pickle_key: *const u8) -> MailimBytes {
    clear_last_error();
    if pickle_key.is_null() {
        set_last_error_msg("pickle_key is NULL");
        return MailimBytes::empty();
    }
    let mut key = [0u8; 32];
    unsafe { ptr::copy_nonoverlapping(pickle_key, key.as_mut_ptr(), 32) };
    match with_mailbox(mailbox, |m| m.socket_dump(SocketHandle(sid), &key)) {
        Some(Ok(bytes)) => bytes_to_ffi(bytes),
        Some(Err(e)) => {
            set_last_error(&e);
            MailimBytes::empty()
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            MailimBytes::empty()
        }
    }
}

/// Restore a socket previously serialized with `mailim_socket_dump`,
/// registering it as a connected socket on `mailbox`. Returns the new
/// socket's handle, or 0 on error.
#[no_mangle]
pub unsafe extern "C" fn mailim_socket_restore(mailbox: u64, dump: *const u8, dump_len: size_t, pickle_key: *const u8) -> u64 {
    clear_last_error();
    if dump.is_null() || pickle_key.is_null() {
        set_last_error_msg("dump/pickle_key is NULL");
        return 0;
    }
    let dump_bytes = std::slice::from_raw_parts(dump, dump_len);
    let mut key = [0u8; 32];
    ptr::copy_nonoverlapping(pickle_key, key.as_mut_ptr(), 32);
    match with_mailbox(mailbox, |m| m.socket_restore(dump_bytes, &key)) {
        Some(Ok(handle)) => handle.0,
        Some(Err(e)) => {
            set_last_error(&e);
            0
        }
        None => {
            set_last_error_msg("invalid mailbox handle");
            0
        }
    }
}

/// Create a new epoll-like readiness group on `mailbox`. Returns an opaque
/// handle, or 0 on an invalid mailbox handle.
#[no_mangle]
pub extern "C" fn mailim_epoll_create(mailbox: u64) -> u64 {
    clear_last_error();
    let Some(eid) = with_mailbox(mailbox, |m| m.epoll_create()) else {
        set_last_error_msg("invalid mailbox handle");
        return 0;
    };
    let mailbox_arc = registry().mailboxes.read().unwrap().get(&mailbox).cloned().unwrap();
    let handle = next_handle();
    registry().epolls.write().unwrap().insert(handle, (mailbox_arc, eid));
    handle
}

fn with_epoll<R>(handle: u64, f: impl FnOnce(&Arc<Mailbox>, u64) -> R) -> Option<R> {
    registry().epolls.read().unwrap().get(&handle).map(|(m, eid)| f(m, *eid))
}

/// Close an epoll group. Any thread blocked in `mailim_epoll_wait` on it
/// wakes immediately with empty sets.
#[no_mangle]
pub extern "C" fn mailim_epoll_close(epoll: u64) {
    if let Some((m, eid)) = registry().epolls.write().unwrap().remove(&epoll) {
        m.epoll_close(eid);
    }
}

unsafe fn socket_set(ids: *const u64, len: size_t) -> HashSet<u64> {
    if ids.is_null() || len == 0 {
        return HashSet::new();
    }
    std::slice::from_raw_parts(ids, len).iter().copied().collect()
}

/// Register sockets `read_ids`/`except_ids` for readability/exception
/// interest on `epoll`. Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn mailim_epoll_add(
    epoll: u64,
    read_ids: *const u64,
    read_len: size_t,
    except_ids: *const u64,
    except_len: size_t,
) -> c_int {
    clear_last_error();
    let rset = socket_set(read_ids, read_len);
    let xset = socket_set(except_ids, except_len);
    match with_epoll(epoll, |m, eid| m.epoll_add(eid, rset, xset)) {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            set_last_error(&e);
            -1
        }
        None => {
            set_last_error_msg("invalid epoll handle");
            -1
        }
    }
}

/// Remove sockets `read_ids`/`except_ids` from `epoll`'s interest sets.
/// Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn mailim_epoll_remove(
    epoll: u64,
    read_ids: *const u64,
    read_len: size_t,
    except_ids: *const u64,
    except_len: size_t,
) -> c_int {
    clear_last_error();
    let rset = socket_set(read_ids, read_len);
    let xset = socket_set(except_ids, except_len);
    match with_epoll(epoll, |m, eid| m.epoll_remove(eid, rset, xset)) {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            set_last_error(&e);
            -1
        }
        None => {
            set_last_error_msg("invalid epoll handle");
            -1
        }
    }
}

/// Block up to `timeout_ms` (negative: indefinitely) for any registered
/// socket on `epoll` to become ready, writing the ready socket ids into
/// `read_out`/`except_out` (each capacity `*_cap` entries) and the actual
/// counts into `*_out_len`. Returns 0 on success, -1 on error, -2 if an
/// output buffer was too small (counts are still written so the caller can
/// retry with bigger buffers).
#[no_mangle]
pub unsafe extern "C" fn mailim_epoll_wait(
    epoll: u64,
    timeout_ms: i64,
    read_out: *mut u64,
    read_cap: size_t,
    read_out_len: *mut size_t,
    except_out: *mut u64,
    except_cap: size_t,
    except_out_len: *mut size_t,
) -> c_int {
    clear_last_error();
    let timeout = if timeout_ms < 0 { None } else { Some(Duration::from_millis(timeout_ms as u64)) };
    let (rset, xset) = match with_epoll(epoll, |m, eid| m.epoll_wait(eid, timeout)) {
        Some(Ok(sets)) => sets,
        Some(Err(e)) => {
            set_last_error(&e);
            return -1;
        }
        None => {
            set_last_error_msg("invalid epoll handle");
            return -1;
        }
    };
    if !read_out_len.is_null() {
        *read_out_len = rset.len();
    }
    if !except_out_len.is_null() {
        *except_out_len = xset.len();
    }
    let mut ok = true;
    if rset.len() > read_cap {
        ok = false;
    } else if !read_out.is_null() {
        for (i, id) in rset.into_iter().enumerate() {
            *read_out.add(i) = id;
        }
    }
    if xset.len() > except_cap {
        ok = false;
    } else if !except_out.is_null() {
        for (i, id) in xset.into_iter().enumerate() {
            *except_out.add(i) = id;
        }
    }
    if ok {
        0
    } else {
        set_last_error_msg("output buffer too small");
        -2
    }
}

/// Generate a fresh secure-socket identity: writes the 32-byte identity
/// key and 32-byte signing (verification) key into the caller's buffers --
/// publish the signing key to the intended peer out-of-band -- and returns
/// the serialized handshake bundle to pass as `handshake_bundle` to
/// `mailim_socket_connect`, or to keep and hand to peers who will dial in
/// via `mailim_socket_accept`'s `MAILIM_ACCEPT_SECURE` decision.
#[no_mangle]
pub unsafe extern "C" fn mailim_generate_handshake_bundle(identity_key_out: *mut u8, sign_key_out: *mut u8) -> MailimBytes {
    let (ratchet, bundle): (RatchetEngine, _) = Mailbox::generate_handshake_bundle();
    if !identity_key_out.is_null() {
        ptr::copy_nonoverlapping(ratchet.identity_key().as_ptr(), identity_key_out, 32);
    }
    if !sign_key_out.is_null() {
        ptr::copy_nonoverlapping(ratchet.sign_key().as_ptr(), sign_key_out, 32);
    }
    bytes_to_ffi(bundle.to_bytes())
}

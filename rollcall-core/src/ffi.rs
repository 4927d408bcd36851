//! C ABI for linking rollcall-core as a static library from Android (NDK) or other C/C++ hosts.
//! The host owns the BLE stack; it forwards link events here and drains the resulting actions
//! with `rollcall_engine_next_action`. Times are milliseconds since `rollcall_engine_create`.

use std::collections::VecDeque;
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::slice;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::protocol::StudentRecord;
use crate::session::{AttendanceEngine, OutboundAction};

/// Bumped when a function signature or action kind changes.
pub const FFI_ABI_VERSION: u8 = 1;

pub const ACTION_SEND: c_int = 1;
pub const ACTION_NOTIFY: c_int = 2;
pub const ACTION_DELIVER: c_int = 3;
pub const ACTION_CLOSE: c_int = 4;
pub const ACTION_QUEUE_CHANGED: c_int = 5;
pub const ACTION_FAILED: c_int = 6;

struct EngineHandle {
    engine: AttendanceEngine,
    pending: VecDeque<OutboundAction>,
    epoch: Instant,
}

impl EngineHandle {
    fn at(&self, now_ms: u64) -> Instant {
        self.epoch + Duration::from_millis(now_ms)
    }

    fn push(&mut self, actions: Vec<OutboundAction>) -> c_int {
        let n = actions.len();
        self.pending.extend(actions);
        n as c_int
    }
}

/// Split an action into (kind, peer, body) for the C side.
fn flatten(action: &OutboundAction) -> (c_int, &str, Vec<u8>) {
    match action {
        OutboundAction::Send(peer, frame) => (ACTION_SEND, peer.as_str(), frame.clone()),
        OutboundAction::Notify(peer, frame) => (ACTION_NOTIFY, peer.as_str(), frame.clone()),
        OutboundAction::Deliver(peer, record) => {
            let body = format!("{}|{}", record.name, record.roll_number);
            (ACTION_DELIVER, peer.as_str(), body.into_bytes())
        }
        OutboundAction::Close(peer) => (ACTION_CLOSE, peer.as_str(), Vec::new()),
        OutboundAction::QueueChanged(s) => {
            let body = format!(
                "{}|{}|{}|{}|{}",
                s.queue_size,
                s.active_connections,
                s.processing_connections,
                s.max_connections,
                s.estimated_wait_secs
            );
            (ACTION_QUEUE_CHANGED, "", body.into_bytes())
        }
        OutboundAction::Failed(f) => (ACTION_FAILED, "", f.to_string().into_bytes()),
    }
}

unsafe fn handle<'a>(h: *mut c_void) -> Option<&'a mut EngineHandle> {
    (h as *mut EngineHandle).as_mut()
}

unsafe fn peer_str<'a>(peer: *const c_char) -> Option<&'a str> {
    if peer.is_null() {
        return None;
    }
    CStr::from_ptr(peer).to_str().ok()
}

#[no_mangle]
pub extern "C" fn rollcall_core_version() -> u8 {
    FFI_ABI_VERSION
}

/// Create an engine with default settings and the given link ceiling (0 keeps the default).
/// Returns an opaque handle.
#[no_mangle]
pub extern "C" fn rollcall_engine_create(max_connections: u32) -> *mut c_void {
    let mut config = EngineConfig::default();
    if max_connections > 0 {
        config.max_connections = max_connections as usize;
    }
    let handle = EngineHandle {
        engine: AttendanceEngine::new(config),
        pending: VecDeque::new(),
        epoch: Instant::now(),
    };
    Box::into_raw(Box::new(handle)) as *mut c_void
}

/// Destroy engine. No-op if h is null.
#[no_mangle]
pub extern "C" fn rollcall_engine_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut EngineHandle) };
}

/// Link came up. Returns the number of actions queued, or -1 on bad arguments.
#[no_mangle]
pub extern "C" fn rollcall_engine_on_connect(
    h: *mut c_void,
    peer: *const c_char,
    now_ms: u64,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_connect(peer, now);
    hd.push(actions)
}

#[no_mangle]
pub extern "C" fn rollcall_engine_on_services_discovered(
    h: *mut c_void,
    peer: *const c_char,
    now_ms: u64,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_services_discovered(peer, now);
    hd.push(actions)
}

/// Bytes written by the peer to the attendance characteristic.
#[no_mangle]
pub extern "C" fn rollcall_engine_on_data(
    h: *mut c_void,
    peer: *const c_char,
    bytes: *const u8,
    len: usize,
    now_ms: u64,
) -> c_int {
    if bytes.is_null() {
        return -1;
    }
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let data = unsafe { slice::from_raw_parts(bytes, len) };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_data(peer, data, now);
    hd.push(actions)
}

#[no_mangle]
pub extern "C" fn rollcall_engine_on_disconnect(
    h: *mut c_void,
    peer: *const c_char,
    now_ms: u64,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_disconnect(peer, now);
    hd.push(actions)
}

/// A write to the peer failed; the engine closes the link.
#[no_mangle]
pub extern "C" fn rollcall_engine_on_write_failed(
    h: *mut c_void,
    peer: *const c_char,
    now_ms: u64,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_write_failed(peer, now);
    hd.push(actions)
}

/// The peer is gone for good (scan lost it, user ended the session). Drops it from the queue
/// and frees any slot it held.
#[no_mangle]
pub extern "C" fn rollcall_engine_on_peer_departed(
    h: *mut c_void,
    peer: *const c_char,
    now_ms: u64,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.on_peer_departed(peer, now);
    hd.push(actions)
}

/// RSSI and round-trip latency for a peer, e.g. from a scan result.
#[no_mangle]
pub extern "C" fn rollcall_engine_on_link_metrics(
    h: *mut c_void,
    peer: *const c_char,
    signal_dbm: i32,
    latency_ms: u32,
) -> c_int {
    let (Some(hd), Some(peer)) = (unsafe { handle(h) }, unsafe { peer_str(peer) }) else {
        return -1;
    };
    let actions = hd.engine.on_link_metrics(peer, signal_dbm, u64::from(latency_ms));
    hd.push(actions)
}

/// Call every few hundred milliseconds.
#[no_mangle]
pub extern "C" fn rollcall_engine_tick(h: *mut c_void, now_ms: u64) -> c_int {
    let Some(hd) = (unsafe { handle(h) }) else {
        return -1;
    };
    let now = hd.at(now_ms);
    let actions = hd.engine.tick(now);
    hd.push(actions)
}

/// Pop the next action. Writes its kind to out_kind, the peer address (nul-terminated, empty for
/// engine-wide actions) to out_peer, and the body to out_buf. Returns body length, -1 if no
/// action is pending or arguments are bad, -2 if a buffer is too small (action stays queued).
#[no_mangle]
pub extern "C" fn rollcall_engine_next_action(
    h: *mut c_void,
    out_kind: *mut c_int,
    out_peer: *mut u8,
    out_peer_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if out_kind.is_null() || out_peer.is_null() || out_buf.is_null() {
        return -1;
    }
    let Some(hd) = (unsafe { handle(h) }) else {
        return -1;
    };
    let Some(action) = hd.pending.front() else {
        return -1;
    };
    let (kind, peer, body) = flatten(action);
    if peer.len() + 1 > out_peer_len || body.len() > out_buf_len {
        return -2;
    }
    unsafe {
        *out_kind = kind;
        out_peer.copy_from_nonoverlapping(peer.as_ptr(), peer.len());
        *out_peer.add(peer.len()) = 0;
        out_buf.copy_from_nonoverlapping(body.as_ptr(), body.len());
    }
    let len = body.len() as c_int;
    hd.pending.pop_front();
    len
}

/// Current queue size and live link count. Returns 0 on success, -1 on bad arguments.
#[no_mangle]
pub extern "C" fn rollcall_engine_status(
    h: *mut c_void,
    out_queue_size: *mut u32,
    out_total_connections: *mut u32,
) -> c_int {
    if out_queue_size.is_null() || out_total_connections.is_null() {
        return -1;
    }
    let Some(hd) = (unsafe { handle(h) }) else {
        return -1;
    };
    let status = hd.engine.status();
    unsafe {
        *out_queue_size = status.queue_size as u32;
        *out_total_connections = status.total_connections as u32;
    }
    0
}

/// Check a record before the attendee side sends it. Returns 0 if valid, 1 if not, -1 on bad
/// arguments.
#[no_mangle]
pub extern "C" fn rollcall_validate_record(name: *const c_char, roll_number: *const c_char) -> c_int {
    let (Some(name), Some(roll)) = (unsafe { peer_str(name) }, unsafe { peer_str(roll_number) })
    else {
        return -1;
    };
    match StudentRecord::new(name, roll).validate() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

//! Process-wide counters for the serial link and message flow.
//! Exposed read-only through `GET /api/metrics`.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FRAMES_REJECTED: AtomicU64 = AtomicU64::new(0);
static UNKNOWN_TYPES: AtomicU64 = AtomicU64::new(0);
static SMS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static SMS_SENT: AtomicU64 = AtomicU64::new(0);
static SMS_FAILED: AtomicU64 = AtomicU64::new(0);
static SMS_CONFIRMED: AtomicU64 = AtomicU64::new(0);
static CALLS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static STATUS_POLLS: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static DISCONNECTIONS: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
/// Malformed, untyped, or oversized lines.
pub fn inc_frames_rejected() {
    FRAMES_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unknown_types() {
    UNKNOWN_TYPES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_received() {
    SMS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
/// Command written to the port; the device has not confirmed yet.
pub fn inc_sms_sent() {
    SMS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_failed() {
    SMS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sms_confirmed() {
    SMS_CONFIRMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_calls_received() {
    CALLS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_status_polls() {
    STATUS_POLLS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connections() {
    CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_disconnections() {
    DISCONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub unknown_types: u64,
    pub sms_received: u64,
    pub sms_sent: u64,
    pub sms_failed: u64,
    pub sms_confirmed: u64,
    pub calls_received: u64,
    pub status_polls: u64,
    pub connections: u64,
    pub disconnections: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        frames_rejected: FRAMES_REJECTED.load(Ordering::Relaxed),
        unknown_types: UNKNOWN_TYPES.load(Ordering::Relaxed),
        sms_received: SMS_RECEIVED.load(Ordering::Relaxed),
        sms_sent: SMS_SENT.load(Ordering::Relaxed),
        sms_failed: SMS_FAILED.load(Ordering::Relaxed),
        sms_confirmed: SMS_CONFIRMED.load(Ordering::Relaxed),
        calls_received: CALLS_RECEIVED.load(Ordering::Relaxed),
        status_polls: STATUS_POLLS.load(Ordering::Relaxed),
        connections: CONNECTIONS.load(Ordering::Relaxed),
        disconnections: DISCONNECTIONS.load(Ordering::Relaxed),
    }
}

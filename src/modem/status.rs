//! Device status snapshot and its single-entry TTL cache.
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Radio and SIM details reported under `mobile` in a `status_response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileInfo {
    pub is_registered: bool,
    pub is_roaming: bool,
    pub iccid: String,
    pub signal_desc: String,
    pub signal_level: i64,
    pub sim_ready: bool,
    pub rssi: i64,
    /// CSQ, 0..=31
    pub csq: i64,
    /// dBm, roughly -44..=-140
    pub rsrp: i64,
    /// dB, roughly -3..=-19.5
    pub rsrq: f64,
    pub imsi: String,
    pub number: String,
    pub operator: String,
    pub uptime: i64,
}

/// Latest known device state.
///
/// `port_name` and `connected` belong to the gateway, not the device: they are
/// overwritten from the live connection state every time a snapshot is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub cellular_enabled: bool,
    #[serde(rename = "type")]
    pub device_type: String,
    /// Firmware script version
    pub version: String,
    pub mobile: MobileInfo,
    pub timestamp: i64,
    pub mem_kb: i64,
    pub port_name: String,
    pub connected: bool,
}

struct Entry {
    snapshot: StatusSnapshot,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Single-slot cache; an expired entry reads as absent.
#[derive(Default)]
pub struct StatusCache {
    slot: RwLock<Option<Entry>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<StatusSnapshot> {
        let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(entry) if !entry.expired() => Some(entry.snapshot.clone()),
            _ => None,
        }
    }

    pub fn set(&self, snapshot: StatusSnapshot, ttl: Duration) {
        let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Entry {
            snapshot,
            stored_at: Instant::now(),
            ttl,
        });
    }

    pub fn delete(&self) {
        let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

//! Status beacon: a wall-clock-driven emitter producing a fixed-layout
//! link-status record at a fixed cadence, plus the per-second RC
//! packet-rate sampler that feeds it.

use std::time::{Duration, Instant};

use packed_struct::prelude::*;

use crate::config::{BEACON_PERIOD_MS, RC_WINDOW_MS};
use crate::hostmetrics::Sampler;

/// Packed status-frame payload: six bytes, leading bytes cleared to `0xFF`
/// before the fields below overwrite offsets 0-4; offset 5 stays reserved
/// at `0xFF`.
#[derive(PackedStruct, Debug, Copy, Clone)]
#[packed_struct(bytes = "6", endian = "msb", bit_numbering = "msb0")]
pub struct RcStatusFrame {
    pub rssi_rc_uav: i8,
    pub recv_pack_sec: u8,
    pub cpu_usage_uav: u8,
    pub cpu_temp_uav: u8,
    pub uav_is_low_v: u8,
    pub reserved: u8,
}

impl RcStatusFrame {
    pub fn to_bytes(self) -> [u8; 6] {
        self.pack()
    }
}

/// Tracks the two wall-clock windows the beacon drives off of: the
/// 1-second RC packet-rate sample and the 200ms status cadence.
pub struct Beacon {
    rc_window_start: Instant,
    status_start: Instant,
    rc_packets_cnt: u8,
    rc_packets_tmp: u8,
    metrics: Sampler,
}

impl Beacon {
    pub fn new() -> Self {
        let now = Instant::now();
        Beacon {
            rc_window_start: now,
            status_start: now,
            rc_packets_cnt: 0,
            rc_packets_tmp: 0,
            metrics: Sampler::new(),
        }
    }

    /// Called by the uplink pipeline on every accepted RC frame.
    pub fn record_rc_packet(&mut self) {
        self.rc_packets_cnt = self.rc_packets_cnt.saturating_add(1);
    }

    /// Run after I/O in every loop pass. Rolls the 1-second RC-rate window
    /// if due, and returns a fresh [`RcStatusFrame`] if the 200ms beacon
    /// cadence is due — `None` otherwise (no emission this pass).
    pub fn tick(&mut self, rssi: i8) -> Option<RcStatusFrame> {
        let now = Instant::now();

        if now.duration_since(self.rc_window_start) >= Duration::from_millis(RC_WINDOW_MS) {
            self.rc_packets_tmp = self.rc_packets_cnt;
            self.rc_packets_cnt = 0;
            self.rc_window_start = now;
        }

        if now.duration_since(self.status_start) >= Duration::from_millis(BEACON_PERIOD_MS) {
            self.status_start = now;
            let sample = self.metrics.sample();
            return Some(RcStatusFrame {
                rssi_rc_uav: rssi,
                recv_pack_sec: self.rc_packets_tmp,
                cpu_usage_uav: sample.cpu_usage,
                cpu_temp_uav: sample.cpu_temp,
                uav_is_low_v: sample.low_voltage as u8,
                reserved: 0xFF,
            });
        }

        None
    }
}

impl Default for Beacon {
    fn default() -> Self {
        Self::new()
    }
}

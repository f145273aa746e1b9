//! Host-health sampling for the status beacon: CPU usage, CPU temperature,
//! and the Raspberry Pi undervoltage flag.
//!
//! Two `/proc/stat` snapshots averaged across calls, a `/sys/class/thermal`
//! read, and a best-effort throttled-flag read. All three are assumed
//! cheap and are invoked once per beacon emission.

use std::io;

/// One host-health sample, matching the status-frame's health fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub cpu_usage: u8,
    pub cpu_temp: u8,
    pub low_voltage: bool,
}

/// Holds the previous `/proc/stat` snapshot `get_cpu_usage` needs to be
/// called periodically (never as a one-shot) to produce a usage delta.
#[derive(Debug, Default)]
pub struct Sampler {
    prev: [f64; 4],
}

impl Sampler {
    pub fn new() -> Self {
        Sampler { prev: [0.0; 4] }
    }

    /// Read all three host-health fields. A failing reader logs via
    /// `log::warn!` (the `perror` equivalent) and leaves that field at its
    /// zero/false default rather than aborting the beacon.
    pub fn sample(&mut self) -> Sample {
        let cpu_usage = match self.read_cpu_usage() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("could not read cpu usage: {e}");
                0
            }
        };
        let cpu_temp = match read_cpu_temp() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("could not read cpu temperature: {e}");
                0
            }
        };
        let low_voltage = read_low_voltage();

        Sample { cpu_usage, cpu_temp, low_voltage }
    }

    fn read_cpu_usage(&mut self) -> io::Result<u8> {
        let new = read_proc_stat_totals()?;
        let old = self.prev;
        let denom = (old[0] + old[1] + old[2] + old[3]) - (new[0] + new[1] + new[2] + new[3]);
        let load = if denom != 0.0 {
            ((old[0] + old[1] + old[2]) - (new[0] + new[1] + new[2])) / denom * 100.0
        } else {
            0.0
        };
        self.prev = new;
        Ok(if load.is_finite() { load as u8 } else { 0 })
    }
}

fn read_proc_stat_totals() -> io::Result<[f64; 4]> {
    let content = std::fs::read_to_string("/proc/stat")?;
    let first_line = content
        .lines()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty /proc/stat"))?;
    let mut fields = first_line.split_whitespace();
    fields.next(); // "cpu" label
    let mut vals = [0.0f64; 4];
    for slot in vals.iter_mut() {
        let tok = fields
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short /proc/stat line"))?;
        *slot = tok
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad /proc/stat field"))?;
    }
    Ok(vals)
}

fn read_cpu_temp() -> io::Result<u8> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")?;
    let millideg: f32 = raw
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad thermal_zone0/temp"))?;
    Ok((millideg / 1000.0) as u8)
}

/// Best-effort Raspberry Pi `get_throttled`-style undervoltage flag. Returns
/// `false` rather than treating an unavailable source as fatal; the field
/// may simply read stale.
fn read_low_voltage() -> bool {
    const THROTTLED_PATH: &str = "/sys/devices/platform/soc/soc:firmware/get_throttled";
    match std::fs::read_to_string(THROTTLED_PATH) {
        Ok(s) => {
            let trimmed = s.trim().trim_start_matches("0x");
            u32::from_str_radix(trimmed, 16)
                .map(|v| v & 0x1 != 0)
                .unwrap_or(false)
        }
        Err(_) => false,
    }
}

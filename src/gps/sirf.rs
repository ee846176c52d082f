// src/gps/sirf.rs
//! SiRF binary message decoding
//!
//! Messages are handed over as complete frames
//! (`A0 A2 <len:2> <payload> <checksum:2> B0 B3`); all offsets below are
//! relative to the start of the frame, so the message id sits at offset 4.
//! Multi-byte fields are big-endian.

use super::data::{Fix, SatelliteInfo};
use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, trace};

/// Measured Tracker Data Out
pub const MID_MEASURED_TRACKER_DATA: u8 = 4;
/// Geodetic Navigation Data
pub const MID_GEODETIC_NAV_DATA: u8 = 41;

pub const SIRF_NUM_CHANNELS: usize = 12;

const GEODETIC_NAV_PAYLOAD_SIZE: usize = 91;
const TRACKER_CHANNEL_SIZE: usize = 15;
const TRACKER_PAYLOAD_SIZE: usize = 8 + TRACKER_CHANNEL_SIZE * SIRF_NUM_CHANNELS;
const HEADER_SIZE: usize = 4;

/// Channel state bit: ephemeris data available
const CHANNEL_STATE_EPHEMERIS: u16 = 0x80;

/// 2-byte bitmask
fn get2d(msg: &[u8], p: usize) -> u16 {
    u16::from_be_bytes([msg[p], msg[p + 1]])
}

/// 2-byte unsigned integer
fn get2u(msg: &[u8], p: usize) -> u32 {
    u32::from(get2d(msg, p))
}

/// 4-byte bitmask
fn get4d(msg: &[u8], p: usize) -> u32 {
    u32::from_be_bytes([msg[p], msg[p + 1], msg[p + 2], msg[p + 3]])
}

/// 4-byte unsigned integer
fn get4u(msg: &[u8], p: usize) -> u64 {
    u64::from(get4d(msg, p))
}

/// 4-byte signed integer, two's complement
fn get4s(msg: &[u8], p: usize) -> i32 {
    get4d(msg, p) as i32
}

fn prn_bit(prn: u8) -> u32 {
    match prn {
        1..=32 => 1 << (prn - 1),
        _ => 0,
    }
}

/// Stateful SiRF decoder
#[derive(Debug, Default)]
pub struct SirfParser {
    satellites: Vec<SatelliteInfo>,
    ephemeris_mask: u32,
    almanac_mask: u32,
    used_in_fix_mask: u32,
    reports: Vec<Option<Fix>>,
}

impl SirfParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the fixes (`Some`) and fix-loss signals (`None`) produced so far
    pub fn take_reports(&mut self) -> Vec<Option<Fix>> {
        std::mem::take(&mut self.reports)
    }

    /// Satellites reported by the last tracker data message
    pub fn satellites(&self) -> &[SatelliteInfo] {
        &self.satellites
    }

    /// Bit `prn - 1` set for every satellite with ephemeris
    pub fn ephemeris_mask(&self) -> u32 {
        self.ephemeris_mask
    }

    pub fn almanac_mask(&self) -> u32 {
        self.almanac_mask
    }

    /// Satellites used in the last navigation solution
    pub fn used_in_fix_mask(&self) -> u32 {
        self.used_in_fix_mask
    }

    /// Feed one frame found at `buf[offset..offset + length]`.
    ///
    /// Returns false for unknown message ids, unexpected payload sizes and
    /// frames too short for their declared payload.
    pub fn put_message(&mut self, buf: &[u8], offset: usize, length: usize) -> bool {
        let Some(msg) = offset
            .checked_add(length)
            .and_then(|end| buf.get(offset..end))
        else {
            debug!("SiRF frame out of bounds: offset {} length {}", offset, length);
            return false;
        };
        if msg.len() <= HEADER_SIZE {
            debug!("SiRF frame too short: {}", msg.len());
            return false;
        }

        match msg[HEADER_SIZE] {
            MID_MEASURED_TRACKER_DATA => self.parse_measured_tracker_data(msg),
            MID_GEODETIC_NAV_DATA => self.parse_geodetic_nav_data(msg),
            id => {
                trace!("Unhandled SiRF message id {}", id);
                false
            }
        }
    }

    fn check_payload(msg: &[u8], expected: usize, name: &str) -> bool {
        let payload_size = get2u(msg, 2) as usize;
        if payload_size != expected {
            debug!("{} error: payload size {} != {}", name, payload_size, expected);
            return false;
        }
        if msg.len() < HEADER_SIZE + payload_size {
            debug!("{} error: truncated frame, {} bytes", name, msg.len());
            return false;
        }
        true
    }

    fn parse_geodetic_nav_data(&mut self, msg: &[u8]) -> bool {
        if !Self::check_payload(msg, GEODETIC_NAV_PAYLOAD_SIZE, "Geodetic navigation data") {
            return false;
        }

        // Field 2. Navigation valid: any set bit means invalid
        let nav_valid = get2d(msg, 5) == 0;
        // Fields 6-11. UTC date and time
        let year = get2u(msg, 15) as i32;
        let month = u32::from(msg[17]);
        let day = u32::from(msg[18]);
        let hour = u32::from(msg[19]);
        let minute = u32::from(msg[20]);
        let second_ms = get2u(msg, 21);
        // Field 12. Satellites used in solution
        self.used_in_fix_mask = get4d(msg, 23);
        // Fields 13-16. Position
        let latitude = f64::from(get4s(msg, 27)) * 1.0e-7;
        let longitude = f64::from(get4s(msg, 31)) * 1.0e-7;
        let alt_ellipsoid = f64::from(get4s(msg, 35)) * 0.01;
        let alt_msl = f64::from(get4s(msg, 39)) * 0.01;
        // Fields 18-19. Speed and course over ground
        let speed = f64::from(get2u(msg, 44)) * 0.01;
        let bearing = f64::from(get2u(msg, 46)) * 0.01;
        // Field 23. Estimated horizontal position error
        let ehpe = get4u(msg, 54) as f64 * 0.01;
        // Fields 34-35. Satellites in fix, HDOP
        let satellites = u32::from(msg[92]);
        let hdop = f64::from(msg[93]) * 0.2;

        for sat in &mut self.satellites {
            sat.used = self.used_in_fix_mask & prn_bit(sat.prn) != 0;
        }

        if !nav_valid {
            self.reports.push(None);
            return true;
        }

        let date = NaiveDate::from_ymd_opt(year, month, day);
        let time = NaiveTime::from_hms_milli_opt(hour, minute, second_ms / 1000, second_ms % 1000);
        let (Some(date), Some(time)) = (date, time) else {
            debug!(
                "Geodetic navigation data with invalid UTC time {}-{}-{} {}:{}:{}",
                year, month, day, hour, minute, second_ms
            );
            self.reports.push(None);
            return true;
        };

        let mut fix = Fix::new(date.and_time(time).and_utc(), latitude, longitude);
        fix.altitude = Some(alt_ellipsoid);
        fix.speed = Some(speed);
        fix.bearing = Some(bearing);
        fix.accuracy = Some(ehpe);
        fix.extras.satellites = Some(satellites);
        fix.extras.hdop = Some(hdop);
        fix.extras.geoid_height = Some(alt_ellipsoid - alt_msl);
        self.reports.push(Some(fix));

        true
    }

    fn parse_measured_tracker_data(&mut self, msg: &[u8]) -> bool {
        if !Self::check_payload(msg, TRACKER_PAYLOAD_SIZE, "Measured tracker data") {
            return false;
        }

        let mut ephemeris_mask = 0;
        let mut almanac_mask = 0;
        self.satellites.clear();

        for channel in msg[HEADER_SIZE + 8..]
            .chunks_exact(TRACKER_CHANNEL_SIZE)
            .take(SIRF_NUM_CHANNELS)
        {
            let prn = channel[0];
            if prn == 0 {
                continue;
            }
            let state = get2d(channel, 3);
            let cno_sum: u32 = channel[5..15].iter().map(|&c| u32::from(c)).sum();

            let mut sat = SatelliteInfo::new(prn);
            sat.azimuth = Some(f32::from(channel[1]) * 1.5);
            sat.elevation = Some(f32::from(channel[2]) * 0.5);
            sat.snr = Some(cno_sum as f32 / 10.0);
            sat.used = self.used_in_fix_mask & prn_bit(prn) != 0;

            if state & CHANNEL_STATE_EPHEMERIS != 0 {
                ephemeris_mask |= prn_bit(prn);
                almanac_mask |= prn_bit(prn);
            }
            self.satellites.push(sat);
        }

        self.ephemeris_mask = ephemeris_mask;
        self.almanac_mask = almanac_mask;
        trace!(
            "SiRF tracker data: {} satellites, ephemeris mask {:#010x}",
            self.satellites.len(),
            ephemeris_mask
        );

        true
    }
}

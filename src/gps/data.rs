// src/gps/data.rs
//! Position fix and satellite data structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Per-channel satellite tracking state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SatelliteInfo {
    pub prn: u8,           // Satellite PRN/ID number
    pub elevation: Option<f32>,  // Elevation angle in degrees
    pub azimuth: Option<f32>,    // Azimuth angle in degrees
    pub snr: Option<f32>,        // Signal-to-noise ratio in dB-Hz
    pub used: bool,              // Whether satellite is used in fix
    pub constellation: &'static str,
}

impl SatelliteInfo {
    pub fn new(prn: u8) -> Self {
        Self {
            prn,
            elevation: None,
            azimuth: None,
            snr: None,
            used: false,
            constellation: Self::determine_constellation(prn),
        }
    }

    fn determine_constellation(prn: u8) -> &'static str {
        match prn {
            1..=32 => "GPS",
            33..=64 => "SBAS",
            65..=96 => "GLONASS",
            120..=158 => "SBAS",
            193..=197 => "QZSS",
            _ => "UNKNOWN",
        }
    }
}

/// Optional values carried alongside a fix
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FixExtras {
    /// Satellites used in the solution
    pub satellites: Option<u32>,
    /// Height of the geoid above the WGS84 ellipsoid, meters
    pub geoid_height: Option<f64>,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
}

impl FixExtras {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A resolved position/velocity/time reading.
///
/// Produced at most once per closed epoch and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above the WGS84 ellipsoid, meters
    pub altitude: Option<f64>,
    /// Speed over ground, m/s
    pub speed: Option<f64>,
    /// Course over ground, degrees
    pub bearing: Option<f64>,
    /// Horizontal accuracy estimate, meters
    pub accuracy: Option<f64>,
    pub extras: FixExtras,
}

impl Fix {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            altitude: None,
            speed: None,
            bearing: None,
            accuracy: None,
            extras: FixExtras::default(),
        }
    }

    /// Format value with unit for display
    fn format_value(value: Option<f64>, unit: &str) -> String {
        match value {
            Some(val) => format!("{:.1}{}", val, unit),
            None => "-".to_string(),
        }
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6},{:.6} alt {} speed {} bearing {} acc {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.latitude,
            self.longitude,
            Self::format_value(self.altitude, "m"),
            Self::format_value(self.speed, "m/s"),
            Self::format_value(self.bearing, "°"),
            Self::format_value(self.accuracy, "m"),
        )?;
        if let Some(sats) = self.extras.satellites {
            write!(f, " sats {}", sats)?;
        }
        Ok(())
    }
}

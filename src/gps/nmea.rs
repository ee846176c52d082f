// src/gps/nmea.rs
//! NMEA sentence parsing and epoch reconciliation
//!
//! A receiver reports one epoch through several independent sentences
//! ($GPGGA, $GPRMC, $GPGSA, ...). The parser collects the sentences that share
//! a time of fix and emits a single [`Fix`] (or a fix-loss report) once the
//! epoch closes.
//!
//! An epoch closes as soon as both GGA and RMC have arrived for it. It is
//! force-closed when a sentence from a different epoch shows up, or when the
//! reader times out waiting for more data.
//!
//! The `*hh` checksum suffix is stripped and not verified.

use super::data::{Fix, FixExtras};
use super::fix_time::NmeaFixTime;
use chrono::{Datelike, NaiveDate, Utc};
use tracing::{debug, trace};

/// Knots to meters per second
pub const KNOTS_TO_MPS: f64 = 0.514444;

const GSA_PRN_SLOTS: usize = 12;

#[derive(Debug, Clone, Copy)]
struct GgaData {
    fix_quality: u8,
    satellites: Option<u32>,
    geoid_height: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct RmcData {
    status_active: bool,
    ddmmyy: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct GsaData {
    fix_mode: Option<u8>,
    prns: [Option<u16>; GSA_PRN_SLOTS],
    pdop: Option<f64>,
    hdop: Option<f64>,
    vdop: Option<f64>,
}

impl GsaData {
    fn used_prn_count(&self) -> u32 {
        self.prns.iter().filter(|prn| matches!(prn, Some(p) if *p > 0)).count() as u32
    }
}

/// Location fields merged from every sentence of the open epoch
#[derive(Debug, Clone, Copy, Default)]
struct EpochLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
    accuracy: Option<f64>,
    speed: Option<f64>,
    bearing: Option<f64>,
}

#[derive(Debug, Default)]
struct Epoch {
    time: Option<NmeaFixTime>,
    closed: bool,
    gga: Option<GgaData>,
    rmc: Option<RmcData>,
    location: EpochLocation,
}

/// Stateful NMEA decoder
#[derive(Debug)]
pub struct NmeaParser {
    epoch: Epoch,
    gsa: Option<GsaData>,
    /// Calendar date of the last epoch, updated by $GPZDA and active $GPRMC
    date: NaiveDate,
    reports: Vec<Option<Fix>>,
}

impl Default for NmeaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NmeaParser {
    /// Create a parser whose date falls back to the system clock
    pub fn new() -> Self {
        Self::with_reference_date(Utc::now().date_naive())
    }

    /// Create a parser with a known starting calendar date
    pub fn with_reference_date(date: NaiveDate) -> Self {
        Self {
            epoch: Epoch {
                closed: true,
                ..Epoch::default()
            },
            gsa: None,
            date,
            reports: Vec::new(),
        }
    }

    /// Calendar date currently used for sentences without a date
    pub fn reference_date(&self) -> NaiveDate {
        self.date
    }

    /// Take the fixes (`Some`) and fix-loss signals (`None`) produced so far
    pub fn take_reports(&mut self) -> Vec<Option<Fix>> {
        std::mem::take(&mut self.reports)
    }

    /// Feed one sentence.
    ///
    /// Returns true if the sentence was recognized and structurally valid,
    /// whether or not it produced a fix.
    pub fn put_message(&mut self, msg: &str) -> bool {
        let msg = msg.trim_end_matches(&['\r', '\n'][..]);

        // Trim checksum
        let msg = match msg.rfind('*') {
            Some(pos) if pos >= 4 => &msg[..pos],
            _ => msg,
        };

        if let Some(body) = msg.strip_prefix("$GPGGA,") {
            self.parse_gpgga(msg, body)
        } else if let Some(body) = msg.strip_prefix("$GPRMC,") {
            self.parse_gprmc(msg, body)
        } else if let Some(body) = msg.strip_prefix("$GPGSA,") {
            self.parse_gpgsa(msg, body)
        } else if let Some(body) = msg.strip_prefix("$GPZDA,") {
            self.parse_gpzda(msg, body)
        } else if msg.starts_with("$GPGSV,") || msg.starts_with("$GPGLL,") || msg.starts_with("$GPVTG,") {
            true
        } else {
            debug!("Unknown NMEA data type. Msg: {}", msg);
            false
        }
    }

    /// Force-close the open epoch after the receiver went quiet
    pub fn put_timeout(&mut self) {
        if !self.epoch.closed {
            self.close_epoch(true);
        }
    }

    fn open_epoch(&mut self, time: NmeaFixTime) {
        self.epoch = Epoch {
            time: Some(time),
            closed: false,
            ..Epoch::default()
        };
    }

    /// Make `time` the open epoch. Returns false if `time` belongs to an
    /// epoch that has already been closed.
    fn prepare_epoch(&mut self, time: NmeaFixTime) -> bool {
        match self.epoch.time {
            Some(current) if current.is_same_epoch(&time) => !self.epoch.closed,
            _ => {
                if !self.epoch.closed {
                    self.close_epoch(true);
                }
                self.open_epoch(time);
                true
            }
        }
    }

    fn close_epoch(&mut self, force: bool) {
        let epoch = &self.epoch;

        // No GPGGA/GPRMC sentences received
        if epoch.gga.is_none() && epoch.rmc.is_none() {
            self.epoch.closed = true;
            return;
        }

        if epoch.closed && !force {
            return;
        }

        // Wait for GGA and RMC
        if !force && (epoch.gga.is_none() || epoch.rmc.is_none()) {
            return;
        }

        let date = match epoch.rmc {
            Some(RmcData {
                status_active: true,
                ddmmyy: Some(ddmmyy),
            }) if ddmmyy > 0 => {
                let century = self.date.year() - self.date.year() % 100;
                NaiveDate::from_ymd_opt(
                    century + (ddmmyy % 100) as i32,
                    ddmmyy / 100 % 100,
                    ddmmyy / 10000 % 100,
                )
                .unwrap_or(self.date)
            }
            _ => self.date,
        };
        self.date = date;

        let location_valid = match (epoch.gga, epoch.rmc) {
            (Some(gga), Some(rmc)) => gga.fix_quality != 0 && rmc.status_active,
            (Some(gga), None) => gga.fix_quality != 0,
            (None, Some(rmc)) => rmc.status_active,
            (None, None) => false,
        };

        let fix = if location_valid { self.compose_fix(date) } else { None };

        match fix {
            Some(fix) => self.reports.push(Some(fix)),
            None => {
                // Location lost
                self.gsa = None;
                self.reports.push(None);
            }
        }

        self.epoch.closed = true;
    }

    fn compose_fix(&self, date: NaiveDate) -> Option<Fix> {
        let epoch = &self.epoch;
        let time = epoch.time?.to_naive_time()?;
        let (latitude, longitude) = match (epoch.location.latitude, epoch.location.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                debug!("Epoch closed without coordinates");
                return None;
            }
        };

        let mut fix = Fix::new(date.and_time(time).and_utc(), latitude, longitude);
        fix.altitude = epoch.location.altitude;
        fix.accuracy = epoch.location.accuracy;
        fix.speed = epoch.location.speed;
        fix.bearing = epoch.location.bearing;

        // Number of satellites used in current solution
        let satellites = epoch
            .gga
            .and_then(|gga| gga.satellites)
            .or_else(|| self.gsa.map(|gsa| gsa.used_prn_count()));

        fix.extras = FixExtras {
            satellites,
            geoid_height: epoch.gga.and_then(|gga| gga.geoid_height),
            pdop: self.gsa.and_then(|gsa| gsa.pdop),
            hdop: self.gsa.and_then(|gsa| gsa.hdop),
            vdop: self.gsa.and_then(|gsa| gsa.vdop),
        };

        Some(fix)
    }

    fn parse_gpgga(&mut self, msg: &str, body: &str) -> bool {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() != 14 {
            debug!("Invalid field count in $GPGGA message: {} - {}", fields.len(), msg);
            return false;
        }

        // Field 1. Time of fix
        let Some(fix_time) = NmeaFixTime::parse(fields[0]) else {
            debug!("Invalid time of fix in $GPGGA message - {}", msg);
            return false;
        };

        // Fields 2-5. Latitude, longitude
        let Ok(latitude) = parse_nmea_degrees(fields[1], fields[2].starts_with('S')) else {
            debug!("Invalid latitude in $GPGGA message - {}", msg);
            return false;
        };
        let Ok(longitude) = parse_nmea_degrees(fields[3], fields[4].starts_with('W')) else {
            debug!("Invalid longitude in $GPGGA message - {}", msg);
            return false;
        };

        // Field 6. Fix quality
        let fix_quality = match fields[5].len() {
            0 => 1,
            1 => match fields[5].chars().next().and_then(|c| c.to_digit(10)) {
                Some(q) => q as u8,
                None => {
                    debug!("Invalid fix quality in $GPGGA message - {}", msg);
                    return false;
                }
            },
            _ => {
                debug!("Invalid fix quality in $GPGGA message - {}", msg);
                return false;
            }
        };

        // Field 7. Number of satellites in use
        let Ok(satellites) = parse_optional::<u32>(fields[6]) else {
            debug!("Invalid number of tracked satellites in $GPGGA message - {}", msg);
            return false;
        };

        // Field 8. HDOP
        let hdop = match parse_optional_f64(fields[7]) {
            Ok(hdop) if hdop.map_or(true, |h| h >= 0.0) => hdop,
            _ => {
                debug!("Invalid HDOP in $GPGGA message - {}", msg);
                return false;
            }
        };

        // Fields 9, 10. Altitude above mean sea level
        let Ok(altitude) = parse_optional_f64(fields[8]) else {
            debug!("Invalid altitude $GPGGA message - {}", msg);
            return false;
        };
        let altitude = altitude.filter(|_| is_meters(fields[9]));

        // Fields 11, 12. Geoid height
        let Ok(geoid_height) = parse_optional_f64(fields[10]) else {
            debug!("Invalid geoid height $GPGGA message - {}", msg);
            return false;
        };
        let geoid_height = geoid_height.filter(|_| is_meters(fields[11]));

        // Fields 13, 14 (DGPS age, station) not interested in

        if !self.prepare_epoch(fix_time) {
            debug!("$GPGGA message from closed epoch - {}", msg);
            return false;
        }

        self.epoch.gga = Some(GgaData {
            fix_quality,
            satellites,
            geoid_height,
        });
        if fix_quality != 0 {
            let location = &mut self.epoch.location;
            location.latitude = latitude.or(location.latitude);
            location.longitude = longitude.or(location.longitude);
            // Ellipsoid altitude
            location.altitude = match (altitude, geoid_height) {
                (Some(msl), Some(geoid)) => Some(msl + geoid),
                _ => None,
            };
            location.accuracy = hdop;
        }
        self.close_epoch(false);

        true
    }

    fn parse_gprmc(&mut self, msg: &str, body: &str) -> bool {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 11 {
            debug!("Invalid field count in $GPRMC message: {} - {}", fields.len(), msg);
            return false;
        }

        // Field 1. Time of fix
        let Some(fix_time) = NmeaFixTime::parse(fields[0]) else {
            debug!("Invalid time of fix in $GPRMC message - {}", msg);
            return false;
        };

        // Field 2. Status: A - active, V - void
        let status_active = match fields[1] {
            "" | "A" => true,
            "V" => false,
            s if s.len() == 1 => {
                trace!("Unknown GPRMC status - {}", msg);
                true
            }
            _ => {
                debug!("Invalid status in $GPRMC message - {}", msg);
                return false;
            }
        };

        // Fields 3-6. Latitude, longitude
        let Ok(latitude) = parse_nmea_degrees(fields[2], fields[3].starts_with('S')) else {
            debug!("Invalid latitude in $GPRMC message - {}", msg);
            return false;
        };
        let Ok(longitude) = parse_nmea_degrees(fields[4], fields[5].starts_with('W')) else {
            debug!("Invalid longitude in $GPRMC message - {}", msg);
            return false;
        };

        // Field 7. Speed over the ground, knots
        let speed = match parse_optional_f64(fields[6]) {
            Ok(knots) if knots.map_or(true, |k| k >= 0.0) => knots.map(|k| k * KNOTS_TO_MPS),
            _ => {
                debug!("Invalid speed over ground in $GPRMC message - {}", msg);
                return false;
            }
        };

        // Field 8. Track angle
        let Ok(bearing) = parse_optional_f64(fields[7]) else {
            debug!("Invalid track angle in $GPRMC message - {}", msg);
            return false;
        };

        // Field 9. Date
        let ddmmyy = match parse_optional::<u32>(fields[8]) {
            Ok(d) if d.map_or(true, |d| d <= 311299) => d,
            _ => {
                debug!("Invalid date in $GPRMC message - {}", msg);
                return false;
            }
        };

        // Fields 10, 11. Magnetic variation, ignored

        if !self.prepare_epoch(fix_time) {
            debug!("$GPRMC message from closed epoch - {}", msg);
            return false;
        }

        self.epoch.rmc = Some(RmcData {
            status_active,
            ddmmyy: ddmmyy.filter(|_| status_active),
        });
        if status_active {
            let location = &mut self.epoch.location;
            location.latitude = latitude.or(location.latitude);
            location.longitude = longitude.or(location.longitude);
            location.speed = speed;
            location.bearing = bearing;
        }
        self.close_epoch(false);

        true
    }

    fn parse_gpgsa(&mut self, msg: &str, body: &str) -> bool {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 17 {
            debug!("Invalid field count in $GPGSA message: {} - {}", fields.len(), msg);
            return false;
        }

        // Field 1 (auto/manual selection) skipped.
        // Field 2. Fix mode 1 - no fix, 2 - 2D fix, 3 - 3D fix
        let fix_mode = match fields[1].chars().next() {
            None => None,
            Some(c) => match c.to_digit(10) {
                Some(mode) => Some(mode as u8),
                None => {
                    debug!("Invalid 3D Fix field $GPGSA message: {}", msg);
                    return false;
                }
            },
        };

        let mut gsa = GsaData {
            fix_mode,
            ..GsaData::default()
        };

        // 12 PRNs
        for (slot, field) in gsa.prns.iter_mut().zip(&fields[2..2 + GSA_PRN_SLOTS]) {
            match parse_optional::<u16>(field) {
                Ok(prn) => *slot = prn,
                Err(()) => {
                    debug!("Invalid PRN in $GPGSA message - {}", msg);
                    return false;
                }
            }
        }

        // Fields 15-17. PDOP, HDOP, VDOP
        let dops: Result<Vec<Option<f64>>, ()> = fields[14..17].iter().map(|f| parse_optional_f64(f)).collect();
        let Ok(dops) = dops else {
            debug!("Invalid DOP field in $GPGSA message - {}", msg);
            return false;
        };
        gsa.pdop = dops[0];
        gsa.hdop = dops[1];
        gsa.vdop = dops[2];

        trace!(
            "$GPGSA. 3dfix: {:?} HDOP: {:?} PDOP: {:?} VDOP: {:?} PRNs: {:?}",
            gsa.fix_mode,
            gsa.hdop,
            gsa.pdop,
            gsa.vdop,
            gsa.prns
        );
        self.gsa = Some(gsa);

        true
    }

    fn parse_gpzda(&mut self, msg: &str, body: &str) -> bool {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 6 {
            debug!("Invalid field count in $GPZDA message: {} - {}", fields.len(), msg);
            return false;
        }

        // Field 1. Current time
        if NmeaFixTime::parse(fields[0]).is_none() {
            debug!("Invalid time in $GPZDA message - {}", msg);
            return false;
        }

        // Fields 2-4. Day, month, year
        let day = fields[1].parse::<u32>().ok().filter(|d| (1..=31).contains(d));
        let month = fields[2].parse::<u32>().ok().filter(|m| (1..=12).contains(m));
        let year = fields[3].parse::<i32>().ok().filter(|y| *y >= 1995);

        let date = match (day, month, year) {
            (Some(d), Some(m), Some(y)) => NaiveDate::from_ymd_opt(y, m, d),
            _ => None,
        };
        let Some(date) = date else {
            debug!("Invalid date in $GPZDA message - {}", msg);
            return false;
        };

        self.date = date;
        trace!("$GPZDA received. New date: {}", date);

        true
    }
}

/// Convert `DDMM.MMMM` / `DDDMM.MMMM` into signed decimal degrees.
///
/// An empty field is `Ok(None)`; a non-numeric field is an error.
pub fn parse_nmea_degrees(field: &str, opposite_direction: bool) -> Result<Option<f64>, ()> {
    let Some(raw) = parse_optional_f64(field)? else {
        return Ok(None);
    };

    // Degrees
    let degrees = (raw / 100.0).floor();
    // Minutes
    let value = degrees + (raw - 100.0 * degrees) / 60.0;

    Ok(Some(if opposite_direction { -value } else { value }))
}

fn parse_optional<T: std::str::FromStr>(field: &str) -> Result<Option<T>, ()> {
    if field.is_empty() {
        return Ok(None);
    }
    field.parse().map(Some).map_err(|_| ())
}

fn parse_optional_f64(field: &str) -> Result<Option<f64>, ()> {
    match parse_optional::<f64>(field)? {
        Some(v) if !v.is_finite() => Err(()),
        v => Ok(v),
    }
}

fn is_meters(unit: &str) -> bool {
    unit.is_empty() || unit.starts_with('M')
}

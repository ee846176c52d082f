// src/gps/fix_time.rs
//! NMEA time-of-fix value

use chrono::NaiveTime;

/// Maximum drift between two time-of-fix values of the same epoch
pub const EPOCH_TOLERANCE_MS: u32 = 200;

/// Time of day carried by an NMEA sentence (`hhmmss[.sss]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmeaFixTime {
    hhmmss: u32,
    millis: u32,
}

impl NmeaFixTime {
    pub fn new(hour: u32, minute: u32, second: u32, millis: u32) -> Self {
        Self {
            hhmmss: hour * 10000 + minute * 100 + second,
            millis,
        }
    }

    /// Parse the time-of-fix field. Fields shorter than `hhmmss` are rejected;
    /// fractions beyond milliseconds are truncated.
    pub fn parse(field: &str) -> Option<Self> {
        if field.len() < 6 {
            return None;
        }
        let (whole, fraction) = field.split_once('.').unwrap_or((field, ""));
        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let time = Self {
            hhmmss: whole.parse().ok()?,
            millis: fraction
                .bytes()
                .chain(std::iter::repeat(b'0'))
                .take(3)
                .fold(0, |ms, digit| ms * 10 + u32::from(digit - b'0')),
        };

        // Second 60 is a leap second
        if time.hour() > 23 || time.minute() > 59 || time.second() > 60 {
            return None;
        }
        Some(time)
    }

    pub fn hour(&self) -> u32 {
        self.hhmmss / 10000
    }

    pub fn minute(&self) -> u32 {
        (self.hhmmss / 100) % 100
    }

    pub fn second(&self) -> u32 {
        self.hhmmss % 100
    }

    pub fn millis(&self) -> u32 {
        self.millis
    }

    /// Whether both values describe the same epoch (same second, at most
    /// 200ms apart)
    pub fn is_same_epoch(&self, other: &NmeaFixTime) -> bool {
        self.hhmmss == other.hhmmss && self.millis.abs_diff(other.millis) <= EPOCH_TOLERANCE_MS
    }

    pub fn to_naive_time(&self) -> Option<NaiveTime> {
        if self.second() == 60 {
            return NaiveTime::from_hms_milli_opt(self.hour(), self.minute(), 59, 1000 + self.millis);
        }
        NaiveTime::from_hms_milli_opt(self.hour(), self.minute(), self.second(), self.millis)
    }
}

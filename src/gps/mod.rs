// src/gps/mod.rs
//! GPS receiver protocol decoding

pub mod data;
pub mod fix_time;
pub mod framing;
pub mod nmea;
pub mod parser;
pub mod sirf;

pub use data::{Fix, FixExtras, SatelliteInfo};
pub use fix_time::NmeaFixTime;
pub use framing::{Frame, MessageFramer};
pub use parser::{FixListener, MessageParser};

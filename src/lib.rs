// src/lib.rs
//! USB GPS bridge library
//!
//! Decodes NMEA 0183 sentences and SiRF binary messages from a serial GPS
//! receiver into position fixes, and manages the receiver's connection
//! lifecycle: device hot-plug, permission, reconnection with backoff and
//! baud rate detection.

pub mod config;
pub mod error;
pub mod gps;
pub mod monitor;
pub mod serial;
pub mod session;

// Re-export main types for convenience
pub use config::BridgeConfig;
pub use error::{ControllerError, GpsError, Result};
pub use gps::{Fix, MessageParser};
pub use serial::{DeviceId, SerialLineConfiguration};
pub use session::{ConnectionSession, ConnectionState, DeviceEvent};

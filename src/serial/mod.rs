// src/serial/mod.rs
//! Serial line settings and device transports

pub mod controller;
pub mod line;
pub mod port;

pub use controller::{DeviceId, DeviceProbe, SerialController, SerialLink};
pub use line::{BaudRate, DataBits, Parity, SerialLineConfiguration, StopBits};
pub use port::{SerialPortProbe, TokioSerialController};

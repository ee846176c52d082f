// src/serial/controller.rs
//! Device handles and the serial transport abstraction

use super::line::SerialLineConfiguration;
use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Identity of a hardware device (a port name for tokio-serial devices)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte streams of an attached device
pub struct SerialLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl SerialLink {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

/// Serial transport for one device.
///
/// At most one link is live per controller: `attach` releases any previous
/// link before opening a new one, and `detach` must make pending reads on the
/// old link fail or end.
pub trait SerialController: Send {
    fn device_id(&self) -> &DeviceId;

    fn configuration(&self) -> &SerialLineConfiguration;

    /// Store the settings used by the next `attach`; applied immediately
    /// when attached. The baud rate must be resolved (not auto).
    fn set_configuration(&mut self, config: SerialLineConfiguration) -> Result<(), ControllerError>;

    fn attach(&mut self) -> Result<SerialLink, ControllerError>;

    fn detach(&mut self);

    fn is_attached(&self) -> bool;
}

/// Capability probe: "is this a supported serial chipset"
pub trait DeviceProbe: Send + Sync {
    /// Supported devices currently present
    fn supported_devices(&self) -> Vec<DeviceId>;

    /// Build a controller for `device`, `None` when it is absent or unsupported
    fn probe(&self, device: &DeviceId) -> Option<Box<dyn SerialController>>;
}

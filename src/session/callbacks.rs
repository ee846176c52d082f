// src/session/callbacks.rs
//! Collaborators the connection session reports to

use super::state::ConnectionState;
use crate::gps::data::Fix;
use crate::serial::DeviceId;
use serde::Serialize;
use tracing::debug;

/// Availability reported to the location consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    /// Receiver connected, waiting for a fix
    TemporarilyUnavailable,
    OutOfService,
}

/// Consumer of parsed fixes
pub trait LocationSink: Send + Sync {
    /// `None` signals that the fix was lost
    fn publish(&self, fix: Option<&Fix>);

    fn set_device_status(&self, status: DeviceStatus);
}

/// Lifecycle notifications. Every method defaults to a no-op.
pub trait SessionCallbacks: Send + Sync {
    fn on_connected(&self) {}

    fn on_connection_lost(&self) {}

    fn on_stopped(&self) {}

    fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {}

    /// `baud_rate` is 0 when detection failed
    fn on_autobaud_completed(&self, _success: bool, _baud_rate: u32) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {}

/// Host-side permission flow; answers arrive later as
/// [`DeviceEvent::PermissionResult`]
pub trait PermissionRequester: Send + Sync {
    fn request_permission(&self, device: &DeviceId);
}

/// Requester used when none is installed; nothing will ever be granted
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPermissionRequester;

impl PermissionRequester for NoPermissionRequester {
    fn request_permission(&self, device: &DeviceId) {
        debug!("No permission requester installed, ignoring request for {}", device);
    }
}

/// Hardware events delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceId),
    Detached(DeviceId),
    PermissionResult { device: DeviceId, granted: bool },
}

// src/session/state.rs
//! Connection lifecycle states

use super::callbacks::DeviceStatus;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Created, not started
    Idle,
    /// Waiting for a device or attaching it
    Connecting,
    /// Attached, reading from the receiver
    Connected,
    /// Attach failed or the connection was lost; retrying
    Reconnecting,
    /// Stopped for good
    Cancelled,
}

impl ConnectionState {
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, next) {
            (Cancelled, _) => false,
            (_, Cancelled) => true,

            (Idle, Connecting) => true,

            (Connecting, Connected) => true,
            (Connecting, Reconnecting) => true,

            (Connected, Reconnecting) => true,

            (Reconnecting, Connecting) => true,

            _ => false,
        }
    }

    /// Status reported to the location sink while in this state
    pub fn device_status(&self) -> DeviceStatus {
        match self {
            Self::Connected => DeviceStatus::TemporarilyUnavailable,
            _ => DeviceStatus::OutOfService,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Cancelled => "CANCELLED",
        })
    }
}

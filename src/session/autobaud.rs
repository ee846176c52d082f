// src/session/autobaud.rs
//! Baud rate detection by trial

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_CANDIDATES: [u32; 6] = [4800, 9600, 19200, 38400, 57600, 115200];
pub const DEFAULT_WINDOW_MS: u64 = 2500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutobaudConfig {
    /// Rates tried in order
    pub candidates: Vec<u32>,
    /// How long each rate gets to produce a valid message
    pub window_ms: u64,
}

impl Default for AutobaudConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.to_vec(),
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

impl AutobaudConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Rate used to open the port before probing starts
    pub fn initial_rate(&self) -> u32 {
        self.candidates.first().copied().unwrap_or(DEFAULT_CANDIDATES[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutobaudOutcome {
    Detected(u32),
    /// Every candidate timed out
    Failed,
    /// The message stream ended before a conclusion
    Interrupted,
}

/// One candidate rate under test
#[derive(Debug)]
struct AutobaudProbe {
    rate: u32,
    deadline: Instant,
    received_valid_message: bool,
}

/// Try each candidate rate until a valid message arrives on `messages`.
///
/// `set_rate` switches the live port; candidates it rejects are skipped.
/// Notifications queued before a switch are discarded.
pub async fn detect_baud_rate<F>(
    config: &AutobaudConfig,
    mut set_rate: F,
    messages: &mut mpsc::Receiver<()>,
) -> AutobaudOutcome
where
    F: FnMut(u32) -> Result<(), ControllerError>,
{
    for &rate in &config.candidates {
        if let Err(e) = set_rate(rate) {
            warn!("Autobaud: cannot switch to {} baud: {}", rate, e);
            continue;
        }
        while messages.try_recv().is_ok() {}

        let mut probe = AutobaudProbe {
            rate,
            deadline: Instant::now() + config.window(),
            received_valid_message: false,
        };
        info!("Autobaud: trying {} baud", probe.rate);

        match tokio::time::timeout_at(probe.deadline, messages.recv()).await {
            Ok(Some(())) => probe.received_valid_message = true,
            Ok(None) => return AutobaudOutcome::Interrupted,
            Err(_) => {}
        }

        if probe.received_valid_message {
            info!("Autobaud: detected {} baud", probe.rate);
            return AutobaudOutcome::Detected(probe.rate);
        }
        debug!("Autobaud: no valid message at {} baud", probe.rate);
    }
    AutobaudOutcome::Failed
}

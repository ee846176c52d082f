// src/monitor.rs
//! Host-side wiring of the bridge: port hot-plug polling, permission
//! handling and fix output

use crate::{
    config::BridgeConfig,
    error::{GpsError, Result},
    gps::Fix,
    serial::{port::chipset_name, DeviceId, SerialPortProbe},
    session::{
        ConnectionSession, ConnectionState, DeviceEvent, DeviceStatus, LocationSink,
        PermissionRequester, SessionCallbacks,
    },
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_serial::SerialPortType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 32;

/// Polls the system's serial ports and reports arrivals and removals
pub struct PortWatcher {
    interval: Duration,
    events: mpsc::Sender<DeviceEvent>,
}

impl PortWatcher {
    pub fn new(interval: Duration, events: mpsc::Sender<DeviceEvent>) -> Self {
        Self { interval, events }
    }

    /// Poll `list_ports` until cancelled. Ports present on the first poll are
    /// treated as known and not reported.
    pub async fn run<F>(self, mut list_ports: F, cancel: CancellationToken)
    where
        F: FnMut() -> Vec<DeviceId>,
    {
        let mut known: BTreeSet<DeviceId> = list_ports().into_iter().collect();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    let current: BTreeSet<DeviceId> = list_ports().into_iter().collect();
                    for event in port_changes(&known, &current) {
                        match &event {
                            DeviceEvent::Attached(port) => info!("Serial port detected: {}", port),
                            DeviceEvent::Detached(port) => info!("Serial port removed: {}", port),
                            DeviceEvent::PermissionResult { .. } => {}
                        }
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    }
                    known = current;
                }
            }
        }
    }
}

/// Events turning `known` into `current`; removals first
pub fn port_changes(known: &BTreeSet<DeviceId>, current: &BTreeSet<DeviceId>) -> Vec<DeviceEvent> {
    known
        .difference(current)
        .cloned()
        .map(DeviceEvent::Detached)
        .chain(current.difference(known).cloned().map(DeviceEvent::Attached))
        .collect()
}

/// Names of all serial ports currently present
pub fn available_port_ids() -> Vec<DeviceId> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| DeviceId::new(p.port_name)).collect(),
        Err(e) => {
            debug!("Failed to list serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Grants every permission request; a host without a permission flow
pub struct AutoGrant {
    events: mpsc::Sender<DeviceEvent>,
}

impl AutoGrant {
    pub fn new(events: mpsc::Sender<DeviceEvent>) -> Self {
        Self { events }
    }
}

impl PermissionRequester for AutoGrant {
    fn request_permission(&self, device: &DeviceId) {
        let event = DeviceEvent::PermissionResult {
            device: device.clone(),
            granted: true,
        };
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to queue permission for {}: {}", device, e);
        }
    }
}

/// Writes fixes to the log, or as JSON lines on stdout
pub struct LogSink {
    json: bool,
}

impl LogSink {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn json_line(fix: Option<&Fix>) -> Result<String> {
        Ok(serde_json::to_string(&fix)?)
    }
}

impl LocationSink for LogSink {
    fn publish(&self, fix: Option<&Fix>) {
        if self.json {
            match Self::json_line(fix) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize fix: {}", e),
            }
            return;
        }
        match fix {
            Some(fix) => info!("Fix: {}", fix),
            None => info!("Fix lost"),
        }
    }

    fn set_device_status(&self, status: DeviceStatus) {
        debug!("Device status: {:?}", status);
    }
}

/// Logs lifecycle notifications
pub struct LogCallbacks;

impl SessionCallbacks for LogCallbacks {
    fn on_connected(&self) {
        info!("GPS receiver connected");
    }

    fn on_connection_lost(&self) {
        warn!("GPS receiver connection lost");
    }

    fn on_stopped(&self) {
        info!("Bridge stopped");
    }

    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        info!("{} -> {}", old, new);
    }

    fn on_autobaud_completed(&self, success: bool, baud_rate: u32) {
        if success {
            info!("Receiver speaks {} baud", baud_rate);
        } else {
            warn!("No receiver found at any candidate baud rate");
        }
    }
}

/// Run the bridge until Ctrl-C or until the session stops itself
pub async fn run_bridge(config: BridgeConfig, json: bool) -> Result<()> {
    config.validate()?;
    info!("Starting bridge with {}", config.serial);

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let probe = SerialPortProbe::new(config.allow_any_port).with_port(config.port.clone());

    let session = ConnectionSession::builder(Arc::new(probe), Arc::new(LogSink::new(json)))
        .config(config.session_config())
        .permission_requester(Arc::new(AutoGrant::new(events_tx.clone())))
        .callbacks(Arc::new(LogCallbacks))
        .build();

    let cancel = CancellationToken::new();
    let watcher = PortWatcher::new(config.poll_interval(), events_tx);
    let watcher_task = tokio::spawn(watcher.run(available_port_ids, cancel.clone()));

    session.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.map_err(|e| GpsError::Connection(format!("Failed to wait for Ctrl-C: {}", e)))?;
                info!("Interrupted, shutting down");
                break;
            }
            _ = session.cancelled() => break,
            Some(event) = events_rx.recv() => session.handle_device_event(event),
        }
    }

    session.stop();
    session.join().await;
    cancel.cancel();
    joined("Port watcher", watcher_task.await);
    Ok(())
}

/// Log a background task that panicked or was aborted
fn joined(task: &str, result: std::result::Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{} failed: {}", task, e);
            false
        }
    }
}

/// List available serial ports
pub fn list_serial_ports(config: &BridgeConfig) -> Result<()> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| GpsError::Connection(format!("Failed to list serial ports: {}", e)))?;

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    let probe = SerialPortProbe::new(config.allow_any_port).with_port(config.port.clone());
    println!("Available serial ports:");
    for port in ports {
        let kind = match &port.port_type {
            SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                chipset_name(usb.vid).unwrap_or("unknown chipset")
            ),
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => "unknown".to_string(),
        };
        let marker = if probe.is_supported(&port) { "*" } else { " " };
        println!(" {} {} - {}", marker, port.port_name, kind);
    }
    println!("(* = usable by the bridge)");

    Ok(())
}
